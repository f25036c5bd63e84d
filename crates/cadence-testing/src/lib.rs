//! Fixtures and small harness utilities shared by Cadence's own test suites
//! and by downstream `DataStore` implementations verifying the contract in
//! `cadence_core::store::DataStore`.
//!
//! This crate intentionally does not mock the wall clock: the scheduler and
//! worker loops read `Utc::now()` directly, and both builtin triggers are
//! pure functions of their own state, so tests drive time by constructing
//! fixtures already due (`fire_time` in the past) rather than by advancing a
//! shared clock. What *is* provided is a way to wait for eventually-true
//! conditions without hardcoding a sleep duration at every call site.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::events::{Event, EventBroker, EventKind, Subscription};
use cadence_core::model::{Job, Schedule, Task};
use cadence_core::trigger::Trigger;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A task due immediately, with func `"mod:{id}"`.
pub fn task(id: &str) -> Task {
    Task::new(id, format!("mod:{id}"))
}

/// A once-schedule firing at `fire_time` (defaults to already-due).
pub fn schedule_firing_at(id: &str, task_id: &str, fire_time: DateTime<Utc>) -> Schedule {
    let mut schedule = Schedule::new(id, task_id, Trigger::once(fire_time));
    schedule.next_fire_time = Some(fire_time);
    schedule
}

/// A once-schedule already past its fire time by `overdue_by`.
pub fn overdue_schedule(id: &str, task_id: &str, overdue_by: chrono::Duration) -> Schedule {
    schedule_firing_at(id, task_id, Utc::now() - overdue_by)
}

/// An ad-hoc job with empty args/kwargs, ready to acquire immediately.
pub fn ad_hoc_job(task_id: &str) -> Job {
    Job::ad_hoc(task_id, serde_json::json!([]), serde_json::json!({}))
}

/// A job already past its start deadline, for exercising
/// `missed_start_deadline` handling without waiting on a real clock.
pub fn overdue_job(task_id: &str, overdue_by: chrono::Duration) -> Job {
    let mut job = ad_hoc_job(task_id);
    job.start_deadline = Some(Utc::now() - overdue_by);
    job
}

/// Records every event matching `kinds` (or all events, if `None`) for
/// later inspection. Holds its subscription alive for as long as the
/// recorder is alive.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
    _subscription: Subscription,
}

impl EventRecorder {
    pub fn attach(broker: &Arc<EventBroker>, kinds: Option<HashSet<EventKind>>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let subscription = broker.subscribe(kinds, false, move |event| {
            events_clone.lock().unwrap().push(event.clone());
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn kinds_seen(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(Event::kind).collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

/// A unique schedule or job id scoped to one test, to avoid collisions when
/// tests share a store instance (e.g. a real PostgreSQL database).
pub fn unique_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Poll `condition` until it returns `true` or `timeout` elapses. Panics on
/// timeout so failures point at the assertion, not a silent hang.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overdue_schedule_is_due_now() {
        let schedule = overdue_schedule("s1", "t1", chrono::Duration::seconds(5));
        assert!(schedule.next_fire_time.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn wait_until_returns_once_condition_flips() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        wait_until(Duration::from_secs(1), || {
            flag.load(std::sync::atomic::Ordering::SeqCst)
        })
        .await;
    }

    #[tokio::test]
    #[should_panic(expected = "did not become true")]
    async fn wait_until_panics_on_timeout() {
        wait_until(Duration::from_millis(20), || false).await;
    }

    #[test]
    fn event_recorder_captures_published_events() {
        let broker = EventBroker::new();
        let recorder = EventRecorder::attach(&broker, None);

        let meta = broker.next_meta();
        broker.publish(Event::TaskAdded {
            meta,
            task_id: "t1".to_string(),
        });

        assert_eq!(recorder.kinds_seen(), vec![EventKind::TaskAdded]);
    }
}
