//! Trigger algorithms are out of scope of the core contract (see spec §1) —
//! each one only needs to expose `next() -> Option<timestamp>`, returning
//! strictly increasing timestamps until exhausted. This crate ships just
//! enough to drive the scheduler end to end: a fixed-interval trigger and a
//! one-shot trigger.
//!
//! Triggers are modeled as a closed tagged union rather than a trait object:
//! the store has to serialize and restore trigger state across lease
//! handoffs, and a `Box<dyn Trigger>` would need erased-serde machinery for
//! no benefit over an enum with two variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialized trigger state, re-persisted by `release_schedules` every time
/// a schedule advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Interval(IntervalTrigger),
    Once(OnceTrigger),
}

impl Trigger {
    /// Produce the next fire time, advancing internal state. Returns `Ok(None)`
    /// once the trigger is exhausted.
    ///
    /// Returns `Err` only for triggers computed from external input (e.g. a
    /// cron string parsed lazily); the two builtin triggers never fail, but
    /// the scheduler still treats a failure here as "remove the schedule"
    /// rather than unwrapping, matching real trigger implementations.
    pub fn next(&mut self) -> Result<Option<DateTime<Utc>>, anyhow::Error> {
        match self {
            Trigger::Interval(t) => Ok(t.next()),
            Trigger::Once(t) => Ok(t.next()),
        }
    }

    pub fn interval(interval: chrono::Duration, start: DateTime<Utc>) -> Self {
        Trigger::Interval(IntervalTrigger::new(interval, start))
    }

    pub fn once(fire_time: DateTime<Utc>) -> Self {
        Trigger::Once(OnceTrigger::new(fire_time))
    }
}

/// Fires every `interval` starting at `next_fire`, forever (or until
/// `end_time` if set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalTrigger {
    #[serde(with = "duration_millis")]
    interval: chrono::Duration,
    next_fire: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    pub fn new(interval: chrono::Duration, start: DateTime<Utc>) -> Self {
        Self {
            interval,
            next_fire: Some(start),
            end_time: None,
        }
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    fn next(&mut self) -> Option<DateTime<Utc>> {
        let fire = self.next_fire?;
        if let Some(end) = self.end_time {
            if fire > end {
                self.next_fire = None;
                return None;
            }
        }
        self.next_fire = Some(fire + self.interval);
        Some(fire)
    }
}

/// Fires exactly once, then is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnceTrigger {
    fire_time: Option<DateTime<Utc>>,
}

impl OnceTrigger {
    pub fn new(fire_time: DateTime<Utc>) -> Self {
        Self {
            fire_time: Some(fire_time),
        }
    }

    fn next(&mut self) -> Option<DateTime<Utc>> {
        self.fire_time.take()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &chrono::Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<chrono::Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        Ok(chrono::Duration::milliseconds(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_trigger_advances_by_interval() {
        let start = Utc::now();
        let mut trigger = Trigger::interval(chrono::Duration::seconds(1), start);
        assert_eq!(trigger.next().unwrap(), Some(start));
        assert_eq!(trigger.next().unwrap(), Some(start + chrono::Duration::seconds(1)));
        assert_eq!(trigger.next().unwrap(), Some(start + chrono::Duration::seconds(2)));
    }

    #[test]
    fn interval_trigger_stops_at_end_time() {
        let start = Utc::now();
        let inner = IntervalTrigger::new(chrono::Duration::seconds(1), start)
            .with_end_time(start + chrono::Duration::milliseconds(1500));
        let mut trigger = Trigger::Interval(inner);
        assert_eq!(trigger.next().unwrap(), Some(start));
        assert_eq!(
            trigger.next().unwrap(),
            Some(start + chrono::Duration::seconds(1))
        );
        assert_eq!(trigger.next().unwrap(), None);
        // exhausted trigger keeps returning None
        assert_eq!(trigger.next().unwrap(), None);
    }

    #[test]
    fn once_trigger_fires_exactly_once() {
        let fire = Utc::now();
        let mut trigger = Trigger::once(fire);
        assert_eq!(trigger.next().unwrap(), Some(fire));
        assert_eq!(trigger.next().unwrap(), None);
    }
}
