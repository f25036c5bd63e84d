//! End-to-end scheduler tests against the in-memory store. `cadence-core`
//! dev-depends on `cadence-store-memory` for exactly this purpose — see that
//! crate's own Cargo.toml for the mirrored dev-dependency back onto this one.

use std::time::Duration as StdDuration;

use cadence_store_memory::MemoryDataStore;
use chrono::{Duration, Utc};

use crate::model::{CoalescePolicy, Task};
use crate::scheduler::{AddScheduleOptions, Scheduler};
use crate::trigger::Trigger;

async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(20)).await;
}

#[tokio::test]
async fn add_schedule_computes_first_fire_time_before_persisting() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:t1")).await.unwrap();
    let scheduler = Scheduler::new("sched-1", store.clone());

    let start = Utc::now() - Duration::seconds(1);
    let id = scheduler
        .add_schedule(
            "t1",
            Trigger::once(start),
            AddScheduleOptions::default(),
        )
        .await
        .unwrap();

    let rows = store.get_schedules(Some(&[id])).await.unwrap();
    assert_eq!(rows[0].next_fire_time, Some(start));
}

// Coalesce law: "all" keeps every past-due fire time as a separate job.
#[tokio::test]
async fn tick_coalesces_all_past_due_fires_into_one_job_each() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:t1")).await.unwrap();
    let scheduler = Scheduler::new("sched-1", store.clone());

    let start = Utc::now() - Duration::seconds(3);
    scheduler
        .add_schedule(
            "t1",
            Trigger::interval(Duration::seconds(1), start),
            AddScheduleOptions {
                coalesce: CoalescePolicy::All,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    scheduler.tick_once_for_test().await;

    let jobs = store.get_jobs(None).await.unwrap();
    assert!(jobs.len() >= 3, "expected at least 3 past-due fires, got {}", jobs.len());
}

// Coalesce law: "earliest" collapses a burst of past-due fires into one job
// carrying the oldest fire time.
#[tokio::test]
async fn tick_coalesces_earliest_into_a_single_job() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:t1")).await.unwrap();
    let scheduler = Scheduler::new("sched-1", store.clone());

    let start = Utc::now() - Duration::seconds(3);
    scheduler
        .add_schedule(
            "t1",
            Trigger::interval(Duration::seconds(1), start),
            AddScheduleOptions {
                coalesce: CoalescePolicy::Earliest,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    scheduler.tick_once_for_test().await;

    let jobs = store.get_jobs(None).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].scheduled_fire_time, Some(start));
}

// A grace period shorter than how overdue the fire time already is should
// still be honored by the scheduler when computing `start_deadline` — the
// worker, not the scheduler, is what turns an elapsed deadline into
// `missed_start_deadline` (spec §4.2, §4.4 S4).
#[tokio::test]
async fn tick_sets_start_deadline_from_misfire_grace_time() {
    let store = MemoryDataStore::new();
    store
        .add_task(Task::new("t1", "mod:t1").with_misfire_grace_time(Duration::seconds(5)))
        .await
        .unwrap();
    let scheduler = Scheduler::new("sched-1", store.clone());

    let fire_time = Utc::now() - Duration::seconds(1);
    scheduler
        .add_schedule("t1", Trigger::once(fire_time), AddScheduleOptions::default())
        .await
        .unwrap();

    scheduler.tick_once_for_test().await;

    let jobs = store.get_jobs(None).await.unwrap();
    assert_eq!(jobs[0].start_deadline, Some(fire_time + Duration::seconds(5)));
}

#[tokio::test]
async fn exhausted_once_schedule_is_removed_after_its_tick() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:t1")).await.unwrap();
    let scheduler = Scheduler::new("sched-1", store.clone());

    let fire_time = Utc::now() - Duration::seconds(1);
    let id = scheduler
        .add_schedule("t1", Trigger::once(fire_time), AddScheduleOptions::default())
        .await
        .unwrap();

    scheduler.tick_once_for_test().await;

    let rows = store.get_schedules(Some(&[id])).await.unwrap();
    assert!(rows.is_empty(), "a once-trigger schedule with no more fires should be deleted");
}

#[tokio::test]
async fn run_job_returns_the_handler_return_value() {
    let store = MemoryDataStore::new();
    store.add_task(Task::new("t1", "mod:t1")).await.unwrap();
    let scheduler = Scheduler::new("sched-1", store.clone());
    let registry = crate::registry::TaskRegistry::new();
    registry.register("mod:t1", |args: crate::registry::JobArgs| async move {
        Ok(args.args)
    });
    let worker = crate::worker::Worker::new("worker-1", store.clone(), registry);
    let worker_handle = tokio::spawn(worker.run());

    let result = scheduler
        .run_job(
            "t1",
            crate::scheduler::AddJobOptions {
                args: Some(serde_json::json!([1, 2, 3])),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result, serde_json::json!([1, 2, 3]));
    worker.stop();
    settle().await;
    worker_handle.abort();
}

#[tokio::test]
async fn stop_is_idempotent_and_unblocks_run_loop() {
    let store = MemoryDataStore::new();
    let scheduler = Scheduler::new("sched-1", store);
    let handle = tokio::spawn(scheduler.clone().run());
    settle().await;

    scheduler.stop();
    scheduler.stop();
    let result = tokio::time::timeout(StdDuration::from_secs(1), handle)
        .await
        .expect("scheduler run loop did not stop in time")
        .unwrap();
    assert!(result.is_ok());
}
