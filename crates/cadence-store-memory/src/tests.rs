use std::collections::HashSet;
use std::sync::Arc;

use cadence_core::events::EventKind;
use cadence_core::model::{CoalescePolicy, ConflictPolicy, Job, JobOutcome, JobResult, Schedule, Task};
use cadence_core::store::DataStore;
use cadence_core::trigger::Trigger;
use chrono::{Duration, Utc};
use uuid::Uuid;

use super::MemoryDataStore;

fn task(id: &str) -> Task {
    Task::new(id, format!("mod:{id}"))
}

#[tokio::test]
async fn add_task_is_upsert_preserving_running_jobs() {
    let store = MemoryDataStore::new();
    store.add_task(task("t1")).await.unwrap();

    // Simulate a job having been acquired against t1.
    {
        let mut t = store.tasks.get_mut("t1").unwrap();
        t.running_jobs = 3;
    }

    store.add_task(task("t1").with_max_running_jobs(5)).await.unwrap();
    let reloaded = store.get_task("t1").await.unwrap();
    assert_eq!(reloaded.running_jobs, 3);
    assert_eq!(reloaded.max_running_jobs, Some(5));
}

#[tokio::test]
async fn remove_unknown_task_fails() {
    let store = MemoryDataStore::new();
    let err = store.remove_task("missing").await.unwrap_err();
    assert!(matches!(err, cadence_core::error::StoreError::TaskLookup(_)));
}

// S6: conflict policy semantics for add_schedule.
#[tokio::test]
async fn conflict_policy_exception_then_replace() {
    let store = MemoryDataStore::new();
    store.add_task(task("t1")).await.unwrap();

    let now = Utc::now();
    let schedule = Schedule::new("x", "t1", Trigger::once(now));
    store
        .add_schedule(schedule.clone(), ConflictPolicy::DoNothing)
        .await
        .unwrap();

    let err = store
        .add_schedule(schedule.clone(), ConflictPolicy::Exception)
        .await
        .unwrap_err();
    assert!(matches!(err, cadence_core::error::StoreError::ConflictingId(_)));

    // Row unchanged after the failed exception-policy call.
    let unchanged = store.get_schedules(Some(&["x".to_string()])).await.unwrap();
    assert_eq!(unchanged.len(), 1);

    let mut replacement = schedule;
    replacement.coalesce = CoalescePolicy::All;
    store
        .add_schedule(replacement, ConflictPolicy::Replace)
        .await
        .unwrap();

    let reloaded = store.get_schedules(Some(&["x".to_string()])).await.unwrap();
    assert_eq!(reloaded[0].coalesce, CoalescePolicy::All);
}

#[tokio::test]
async fn conflict_policy_do_nothing_is_silent_no_op() {
    let store = MemoryDataStore::new();
    store.add_task(task("t1")).await.unwrap();
    let now = Utc::now();

    let first = Schedule::new("x", "t1", Trigger::once(now)).with_coalesce(CoalescePolicy::Earliest);
    store.add_schedule(first, ConflictPolicy::DoNothing).await.unwrap();

    let second = Schedule::new("x", "t1", Trigger::once(now)).with_coalesce(CoalescePolicy::All);
    store.add_schedule(second, ConflictPolicy::DoNothing).await.unwrap();

    let reloaded = store.get_schedules(Some(&["x".to_string()])).await.unwrap();
    assert_eq!(reloaded[0].coalesce, CoalescePolicy::Earliest);
}

// S5: two schedulers, one schedule due now — exactly one acquires it.
#[tokio::test]
async fn acquire_schedules_gives_disjoint_results_to_racing_schedulers() {
    let store = MemoryDataStore::new();
    store.add_task(task("t1")).await.unwrap();

    let due = Utc::now() - Duration::seconds(1);
    let mut schedule = Schedule::new("s1", "t1", Trigger::once(due));
    schedule.next_fire_time = Some(due);
    store.add_schedule(schedule, ConflictPolicy::Exception).await.unwrap();

    let a = store.acquire_schedules("scheduler-a", 100).await.unwrap();
    let b = store.acquire_schedules("scheduler-b", 100).await.unwrap();

    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 0);
}

// S1: per-task concurrency bound holds under concurrent acquisition.
#[tokio::test]
async fn acquire_jobs_respects_max_running_jobs() {
    let store = MemoryDataStore::new();
    store.add_task(task("t1").with_max_running_jobs(2)).await.unwrap();

    for _ in 0..5 {
        store
            .add_job(Job::ad_hoc("t1", serde_json::json!([]), serde_json::json!({})))
            .await
            .unwrap();
    }

    let first_batch = store.acquire_jobs("worker-1", 100).await.unwrap();
    assert_eq!(first_batch.len(), 2, "only 2 slots available");

    let second_batch = store.acquire_jobs("worker-1", 100).await.unwrap();
    assert_eq!(second_batch.len(), 0, "no slots left until a release");

    let task_row = store.get_task("t1").await.unwrap();
    assert_eq!(task_row.running_jobs, 2);

    for job in first_batch {
        let result = JobResult::success(job.id, serde_json::json!(null));
        store.release_job("worker-1", "t1", result).await.unwrap();
    }

    let task_row = store.get_task("t1").await.unwrap();
    assert_eq!(task_row.running_jobs, 0);

    let third_batch = store.acquire_jobs("worker-1", 100).await.unwrap();
    assert_eq!(third_batch.len(), 2, "slots freed by release are reusable");
}

// Result consumption: a JobResult is returned to at most one caller.
#[tokio::test]
async fn get_job_result_is_consumed_on_read() {
    let store = MemoryDataStore::new();
    let job_id = Uuid::new_v4();
    store
        .release_job("worker-1", "t1", JobResult::success(job_id, serde_json::json!(1)))
        .await
        .unwrap();

    let first = store.get_job_result(job_id).await.unwrap();
    assert!(first.is_some());
    let second = store.get_job_result(job_id).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn release_job_is_idempotent_for_missing_job() {
    let store = MemoryDataStore::new();
    store.add_task(task("t1")).await.unwrap();
    let job_id = Uuid::new_v4();

    store
        .release_job("worker-1", "t1", JobResult::success(job_id, serde_json::json!(null)))
        .await
        .unwrap();
    // Re-releasing (e.g. a retried RPC) must not panic or double-decrement.
    store
        .release_job("worker-1", "t1", JobResult::success(job_id, serde_json::json!(null)))
        .await
        .unwrap();

    let task_row = store.get_task("t1").await.unwrap();
    assert_eq!(task_row.running_jobs, 0);
}

#[tokio::test]
async fn release_schedules_skips_rows_whose_lease_was_reacquired() {
    let store = MemoryDataStore::new();
    store.add_task(task("t1")).await.unwrap();

    let due = Utc::now() - Duration::seconds(1);
    let mut schedule = Schedule::new("s1", "t1", Trigger::once(due));
    schedule.next_fire_time = Some(due);
    store.add_schedule(schedule, ConflictPolicy::Exception).await.unwrap();

    let acquired = store.acquire_schedules("scheduler-a", 100).await.unwrap();
    let mut stolen = acquired[0].clone();
    // Simulate scheduler-a's lease having already expired and scheduler-b
    // having reacquired the row before scheduler-a calls release.
    {
        let mut row = store.schedules.get_mut("s1").unwrap();
        row.acquired_by = Some("scheduler-b".to_string());
    }
    stolen.next_fire_time = None; // scheduler-a thinks the schedule is exhausted

    store.release_schedules("scheduler-a", vec![stolen]).await.unwrap();

    // scheduler-b's lease must survive scheduler-a's stale release.
    let row = store.get_schedules(Some(&["s1".to_string()])).await.unwrap();
    assert_eq!(row.len(), 1);
    assert_eq!(row[0].acquired_by.as_deref(), Some("scheduler-b"));
}

#[tokio::test]
async fn events_are_published_for_task_and_schedule_lifecycle() {
    let store = MemoryDataStore::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let mut kinds = HashSet::new();
    kinds.insert(EventKind::TaskAdded);
    kinds.insert(EventKind::ScheduleAdded);
    let _sub = store.events().subscribe(Some(kinds), false, move |event| {
        seen_clone.lock().unwrap().push(event.kind());
    });

    store.add_task(task("t1")).await.unwrap();
    let schedule = Schedule::new("s1", "t1", Trigger::once(Utc::now()));
    store.add_schedule(schedule, ConflictPolicy::Exception).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![EventKind::TaskAdded, EventKind::ScheduleAdded]);
}

#[tokio::test]
async fn job_outcome_round_trips_through_job_result() {
    let job_id = Uuid::new_v4();
    let result = JobResult::missed_start_deadline(job_id);
    assert_eq!(result.outcome, JobOutcome::MissedStartDeadline);
}
