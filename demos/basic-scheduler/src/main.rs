//! Minimal end-to-end example: one task, one recurring schedule, one ad-hoc
//! job, running until Ctrl-C or a fixed duration elapses.

use std::time::Duration;

use cadence_core::registry::{JobArgs, TaskRegistry};
use cadence_core::scheduler::AddScheduleOptions;
use cadence_core::supervisor::Supervisor;
use cadence_core::trigger::Trigger;
use cadence_store_memory::MemoryDataStore;
use chrono::Utc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("basic_scheduler=info".parse()?))
        .init();

    let store = MemoryDataStore::new();
    let registry = TaskRegistry::new();
    registry.register("demo:greet", |args: JobArgs| async move {
        let name = args.args[0].as_str().unwrap_or("world").to_string();
        tracing::info!(%name, "hello");
        Ok(serde_json::json!({ "greeted": name }))
    });

    store
        .add_task(cadence_core::model::Task::new("greeter", "demo:greet"))
        .await?;

    let supervisor = Supervisor::new("demo", store, registry);
    supervisor.start().await;

    supervisor
        .scheduler()
        .add_schedule(
            "greeter",
            Trigger::interval(chrono::Duration::seconds(2), Utc::now()),
            AddScheduleOptions {
                args: Some(serde_json::json!(["recurring friend"])),
                ..Default::default()
            },
        )
        .await?;

    let result = supervisor
        .scheduler()
        .run_job(
            "greeter",
            cadence_core::scheduler::AddJobOptions {
                args: Some(serde_json::json!(["one-off visitor"])),
                ..Default::default()
            },
        )
        .await?;
    tracing::info!(?result, "ad-hoc job finished");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
        _ = tokio::time::sleep(Duration::from_secs(10)) => {
            tracing::info!("demo duration elapsed, shutting down");
        }
    }

    supervisor.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
