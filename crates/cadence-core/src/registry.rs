//! Resolves a [`Task`](crate::model::Task)'s `func` — a stable textual
//! reference such as `"reports:send_weekly"` — to an actual callable handle.
//! Rewriting this for strongly-typed targets requires exactly this: an
//! explicit registry mapping reference strings to handles, since Rust has no
//! runtime symbol table to walk the way a dynamic language's worker would.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

/// Arguments passed through from the job to the callable.
#[derive(Debug, Clone)]
pub struct JobArgs {
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
}

pub type HandlerResult = Result<serde_json::Value, anyhow::Error>;
type Handler = Arc<dyn Fn(JobArgs) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Process-local map from task `func` reference to handler. Read-through,
/// append-mostly: registering the same reference again replaces the prior
/// handle (last-registration-wins), the way the store's own task cache is
/// invalidated only by the owning process's own writes.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: Arc<std::sync::RwLock<HashMap<String, Handler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `func_ref`. `F` must be cloneable-free: it is
    /// wrapped once and shared behind an `Arc`.
    pub fn register<F, Fut>(&self, func_ref: impl Into<String>, handler: F)
    where
        F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers
            .write()
            .unwrap()
            .insert(func_ref.into(), boxed);
    }

    pub fn get(&self, func_ref: &str) -> Option<Handler> {
        self.handlers.read().unwrap().get(func_ref).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_handler() {
        let registry = TaskRegistry::new();
        registry.register("double", |args: JobArgs| async move {
            let n = args.args[0].as_i64().unwrap_or(0);
            Ok(serde_json::json!(n * 2))
        });

        let handler = registry.get("double").expect("handler registered");
        let result = handler(JobArgs {
            args: serde_json::json!([21]),
            kwargs: serde_json::json!({}),
        })
        .await
        .unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn unregistered_reference_resolves_to_none() {
        let registry = TaskRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn re_registering_replaces_the_handler() {
        let registry = TaskRegistry::new();
        registry.register("f", |_: JobArgs| async move { Ok(serde_json::json!(1)) });
        registry.register("f", |_: JobArgs| async move { Ok(serde_json::json!(2)) });

        let handler = registry.get("f").unwrap();
        let result = handler(JobArgs {
            args: serde_json::json!([]),
            kwargs: serde_json::json!({}),
        })
        .await
        .unwrap();
        assert_eq!(result, serde_json::json!(2));
    }
}
