//! In-process publish/subscribe. Events are a closed tagged union, not
//! subtypes — subscribers filter by a set of [`EventKind`]s rather than by
//! downcasting. Delivery is synchronous, in publication order, on the
//! publishing call stack; subscriber callbacks must not block.
//!
//! Backends that support cross-process notification (SQL `LISTEN/NOTIFY`,
//! say) may relay store-originated events into a local broker — this broker
//! itself has no notion of where an event came from.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::JobOutcome;

/// Tag used to filter subscriptions; one variant per [`Event`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskAdded,
    TaskUpdated,
    TaskRemoved,
    ScheduleAdded,
    ScheduleUpdated,
    ScheduleRemoved,
    ScheduleDeserializationFailed,
    JobAdded,
    JobAcquired,
    JobReleased,
    JobDeserializationFailed,
    SchedulerStarted,
    SchedulerStopped,
}

/// Every event carries a monotonically unique sequence id and a timestamp,
/// stamped by the broker at publish time so ordering is authoritative even
/// if the underlying store's own clock skews slightly.
#[derive(Debug, Clone)]
pub struct EventMeta {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Event {
    TaskAdded {
        meta: EventMeta,
        task_id: String,
    },
    TaskUpdated {
        meta: EventMeta,
        task_id: String,
    },
    TaskRemoved {
        meta: EventMeta,
        task_id: String,
    },
    ScheduleAdded {
        meta: EventMeta,
        schedule_id: String,
        next_fire_time: Option<DateTime<Utc>>,
    },
    ScheduleUpdated {
        meta: EventMeta,
        schedule_id: String,
        next_fire_time: Option<DateTime<Utc>>,
    },
    ScheduleRemoved {
        meta: EventMeta,
        schedule_id: String,
    },
    ScheduleDeserializationFailed {
        meta: EventMeta,
        schedule_id: String,
        error: String,
    },
    JobAdded {
        meta: EventMeta,
        job_id: Uuid,
        task_id: String,
        schedule_id: Option<String>,
        tags: HashSet<String>,
    },
    JobAcquired {
        meta: EventMeta,
        job_id: Uuid,
        worker_id: String,
    },
    JobReleased {
        meta: EventMeta,
        job_id: Uuid,
        worker_id: String,
        outcome: JobOutcome,
    },
    JobDeserializationFailed {
        meta: EventMeta,
        job_id: Uuid,
        error: String,
    },
    SchedulerStarted {
        meta: EventMeta,
    },
    SchedulerStopped {
        meta: EventMeta,
        error: Option<String>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TaskAdded { .. } => EventKind::TaskAdded,
            Event::TaskUpdated { .. } => EventKind::TaskUpdated,
            Event::TaskRemoved { .. } => EventKind::TaskRemoved,
            Event::ScheduleAdded { .. } => EventKind::ScheduleAdded,
            Event::ScheduleUpdated { .. } => EventKind::ScheduleUpdated,
            Event::ScheduleRemoved { .. } => EventKind::ScheduleRemoved,
            Event::ScheduleDeserializationFailed { .. } => EventKind::ScheduleDeserializationFailed,
            Event::JobAdded { .. } => EventKind::JobAdded,
            Event::JobAcquired { .. } => EventKind::JobAcquired,
            Event::JobReleased { .. } => EventKind::JobReleased,
            Event::JobDeserializationFailed { .. } => EventKind::JobDeserializationFailed,
            Event::SchedulerStarted { .. } => EventKind::SchedulerStarted,
            Event::SchedulerStopped { .. } => EventKind::SchedulerStopped,
        }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    kinds: Option<HashSet<EventKind>>,
    one_shot: bool,
    callback: Callback,
}

/// A scoped subscription handle. Dropping it unsubscribes the callback.
pub struct Subscription {
    id: u64,
    broker: Arc<EventBroker>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}

/// The in-process event broker. The event broker owns the subscriber list
/// and serializes publication.
pub struct EventBroker {
    next_seq: AtomicU64,
    next_sub_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_seq: AtomicU64::new(1),
            next_sub_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Stamp a fresh `EventMeta`. Callers build an `Event` with this before
    /// handing it to [`EventBroker::publish`].
    pub fn next_meta(&self) -> EventMeta {
        EventMeta {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
        }
    }

    /// Subscribe to events, optionally filtered by kind. `one_shot` unsubscribes
    /// automatically after the first matching delivery.
    pub fn subscribe(
        self: &Arc<Self>,
        kinds: Option<HashSet<EventKind>>,
        one_shot: bool,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().push(Subscriber {
            id,
            kinds,
            one_shot,
            callback: Arc::new(callback),
        });
        Subscription {
            id,
            broker: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    /// Deliver `event` synchronously, in publication order, to every matching
    /// subscriber. The subscriber list is snapshotted before delivery so a
    /// callback that drops its own (or another) subscription does not
    /// deadlock or skip entries.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let snapshot: Vec<(u64, bool, Callback)> = {
            let subs = self.subscribers.lock().unwrap();
            subs.iter()
                .filter(|s| s.kinds.as_ref().map_or(true, |k| k.contains(&kind)))
                .map(|s| (s.id, s.one_shot, Arc::clone(&s.callback)))
                .collect()
        };

        let mut expired = Vec::new();
        for (id, one_shot, callback) in snapshot {
            callback(&event);
            if one_shot {
                expired.push(id);
            }
        }

        if !expired.is_empty() {
            let mut subs = self.subscribers.lock().unwrap();
            subs.retain(|s| !expired.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn task_added(broker: &EventBroker, task_id: &str) {
        let meta = broker.next_meta();
        broker.publish(Event::TaskAdded {
            meta,
            task_id: task_id.to_string(),
        });
    }

    #[test]
    fn delivers_in_publish_order() {
        let broker = EventBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = broker.subscribe(None, false, move |event| {
            if let Event::TaskAdded { task_id, .. } = event {
                seen_clone.lock().unwrap().push(task_id.clone());
            }
        });

        task_added(&broker, "a");
        task_added(&broker, "b");
        task_added(&broker, "c");

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn filters_by_kind() {
        let broker = EventBroker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let mut kinds = HashSet::new();
        kinds.insert(EventKind::ScheduleAdded);
        let _sub = broker.subscribe(Some(kinds), false, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        task_added(&broker, "a");
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let meta = broker.next_meta();
        broker.publish(Event::ScheduleAdded {
            meta,
            schedule_id: "s1".into(),
            next_fire_time: None,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_shot_unsubscribes_after_first_delivery() {
        let broker = EventBroker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = broker.subscribe(None, true, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        task_added(&broker, "a");
        task_added(&broker, "b");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let broker = EventBroker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let sub = broker.subscribe(None, false, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        task_added(&broker, "a");
        drop(sub);
        task_added(&broker, "b");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
