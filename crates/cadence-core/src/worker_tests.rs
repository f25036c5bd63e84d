//! Worker execution tests against the in-memory store (spec §4.2, §4.4 S1/S4).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cadence_store_memory::MemoryDataStore;
use chrono::{Duration, Utc};

use crate::model::{Job, JobOutcome, Task};
use crate::registry::{JobArgs, TaskRegistry};
use crate::worker::Worker;

async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
}

// S4: a job whose start_deadline has already passed is recorded as
// `missed_start_deadline` without invoking the registered handler.
#[tokio::test]
async fn missed_start_deadline_short_circuits_execution() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:t1")).await.unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = Arc::clone(&invoked);
    let registry = TaskRegistry::new();
    registry.register("mod:t1", move |_: JobArgs| {
        let invoked = Arc::clone(&invoked_clone);
        async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!(null))
        }
    });

    let mut job = Job::ad_hoc("t1", serde_json::json!([]), serde_json::json!({}));
    job.start_deadline = Some(Utc::now() - Duration::seconds(10));
    let job_id = job.id;
    store.add_job(job).await.unwrap();

    let worker = Worker::new("worker-1", store.clone(), registry);
    let handle = tokio::spawn(worker.clone().run());
    settle().await;
    worker.stop();
    let _ = tokio::time::timeout(StdDuration::from_secs(1), handle).await;

    assert_eq!(invoked.load(Ordering::SeqCst), 0, "handler must not run past its deadline");

    let result = store.get_job_result(job_id).await.unwrap().expect("result recorded");
    assert_eq!(result.outcome, JobOutcome::MissedStartDeadline);
}

// S1: the worker never has more than `concurrency` handler invocations
// in flight at once, even when far more jobs are immediately available.
#[tokio::test]
async fn worker_never_exceeds_its_concurrency_bound() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:t1")).await.unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let in_flight_clone = Arc::clone(&in_flight);
    let max_observed_clone = Arc::clone(&max_observed);

    let registry = TaskRegistry::new();
    registry.register("mod:t1", move |_: JobArgs| {
        let in_flight = Arc::clone(&in_flight_clone);
        let max_observed = Arc::clone(&max_observed_clone);
        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::json!(null))
        }
    });

    for _ in 0..20 {
        store
            .add_job(Job::ad_hoc("t1", serde_json::json!([]), serde_json::json!({})))
            .await
            .unwrap();
    }

    let worker = Worker::with_concurrency("worker-1", store.clone(), registry, 3);
    let handle = tokio::spawn(worker.clone().run());

    settle().await;
    settle().await;
    worker.stop();
    let _ = tokio::time::timeout(StdDuration::from_secs(2), handle).await;

    assert!(max_observed.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn unresolved_task_func_is_recorded_as_an_error_result() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:unregistered")).await.unwrap();

    let job = Job::ad_hoc("t1", serde_json::json!([]), serde_json::json!({}));
    let job_id = job.id;
    store.add_job(job).await.unwrap();

    let worker = Worker::new("worker-1", store.clone(), TaskRegistry::new());
    let handle = tokio::spawn(worker.clone().run());
    settle().await;
    worker.stop();
    let _ = tokio::time::timeout(StdDuration::from_secs(1), handle).await;

    let result = store.get_job_result(job_id).await.unwrap().expect("result recorded");
    assert_eq!(result.outcome, JobOutcome::Error);
}
