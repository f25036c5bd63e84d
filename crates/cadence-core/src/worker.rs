//! Executes acquired jobs and records their results (spec §4.2).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};

use crate::error::StoreError;
use crate::events::EventKind;
use crate::model::{JobResult, RunState};
use crate::registry::{JobArgs, TaskRegistry};
use crate::store::DataStore;

const ACQUIRE_BATCH: usize = 100;
const DEFAULT_CONCURRENCY: usize = 10;

fn run_state_from_u8(value: u8) -> RunState {
    match value {
        0 => RunState::Stopped,
        1 => RunState::Starting,
        2 => RunState::Started,
        _ => RunState::Stopping,
    }
}

struct AtomicRunState(AtomicU8);

impl AtomicRunState {
    fn new() -> Self {
        Self(AtomicU8::new(RunState::Stopped as u8))
    }
    fn get(&self) -> RunState {
        run_state_from_u8(self.0.load(Ordering::SeqCst))
    }
    fn set(&self, state: RunState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Executes acquired jobs on a bounded pool of concurrent tasks.
pub struct Worker {
    identity: String,
    store: Arc<dyn DataStore>,
    registry: TaskRegistry,
    state: AtomicRunState,
    wakeup: Arc<Notify>,
    concurrency: Arc<Semaphore>,
}

impl Worker {
    pub fn new(identity: impl Into<String>, store: Arc<dyn DataStore>, registry: TaskRegistry) -> Arc<Self> {
        Self::with_concurrency(identity, store, registry, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(
        identity: impl Into<String>,
        store: Arc<dyn DataStore>,
        registry: TaskRegistry,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            store,
            registry,
            state: AtomicRunState::new(),
            wakeup: Arc::new(Notify::new()),
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn stop(&self) {
        self.state.set(RunState::Stopping);
        self.wakeup.notify_one();
    }

    /// The worker's main loop. Dispatches each acquired job onto the bounded
    /// concurrency pool and keeps acquiring without waiting for them to
    /// finish.
    pub async fn run(self: Arc<Self>) -> Result<(), StoreError> {
        if self.state.get() != RunState::Stopped {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "worker cannot run: state is {:?}, expected Stopped",
                self.state.get()
            )));
        }
        self.state.set(RunState::Starting);

        let mut wakeup_kinds = HashSet::new();
        wakeup_kinds.insert(EventKind::JobAdded);
        let wakeup = Arc::clone(&self.wakeup);
        let _wakeup_subscription =
            self.store
                .events()
                .subscribe(Some(wakeup_kinds), false, move |_event| {
                    wakeup.notify_one();
                });

        self.state.set(RunState::Started);

        let mut handles = Vec::new();
        while self.state.get() == RunState::Started {
            let jobs = self.store.acquire_jobs(&self.identity, ACQUIRE_BATCH).await?;

            if jobs.is_empty() {
                self.wakeup.notified().await;
                continue;
            }

            for job in jobs {
                let permit = Arc::clone(&self.concurrency);
                let store = Arc::clone(&self.store);
                let registry = self.registry.clone();
                let identity = self.identity.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                    Self::execute_one(store, registry, identity, job).await;
                }));
            }

            handles.retain(|h| !h.is_finished());
        }

        for handle in handles {
            let _ = handle.await;
        }

        self.state.set(RunState::Stopped);
        Ok(())
    }

    async fn execute_one(
        store: Arc<dyn DataStore>,
        registry: TaskRegistry,
        worker_id: String,
        job: crate::model::Job,
    ) {
        let task = match store.get_task(&job.task_id).await {
            Ok(task) => task,
            Err(error) => {
                tracing::error!(job_id = %job.id, %error, "failed to load task for acquired job");
                let result = JobResult::error(job.id, error.to_string());
                if let Err(error) = store.release_job(&worker_id, &job.task_id, result).await {
                    tracing::error!(job_id = %job.id, %error, "failed to release job after task lookup failure");
                }
                return;
            }
        };

        let result = if let Some(deadline) = job.start_deadline {
            if Utc::now() > deadline {
                JobResult::missed_start_deadline(job.id)
            } else {
                Self::invoke(&registry, &task.func, &job).await
            }
        } else {
            Self::invoke(&registry, &task.func, &job).await
        };

        tracing::info!(job_id = %job.id, task_id = %job.task_id, outcome = ?result.outcome, "job finished");

        if let Err(error) = store.release_job(&worker_id, &job.task_id, result).await {
            tracing::error!(job_id = %job.id, %error, "failed to release job");
        }
    }

    async fn invoke(registry: &TaskRegistry, func: &str, job: &crate::model::Job) -> JobResult {
        match registry.get(func) {
            Some(handler) => {
                let args = JobArgs {
                    args: job.args.clone(),
                    kwargs: job.kwargs.clone(),
                };
                match handler(args).await {
                    Ok(return_value) => JobResult::success(job.id, return_value),
                    Err(error) => JobResult::error(job.id, error.to_string()),
                }
            }
            None => JobResult::error(job.id, format!("no handler registered for task func {func:?}")),
        }
    }
}

