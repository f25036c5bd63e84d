//! The persisted entities: [`Task`], [`Schedule`], [`Job`], [`JobResult`].
//!
//! These are plain data — the data store owns all mutation and persistence;
//! scheduler and worker hold only transient in-memory copies during one tick
//! (see the crate-level docs for the ownership invariant).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::Trigger;

/// `chrono::Duration` has no serde impl; encode as milliseconds.
mod duration_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|d| d.num_milliseconds()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<i64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::milliseconds))
    }
}

/// Policy for folding multiple past-due fire times produced by one tick into
/// zero, one, or many jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Keep only the first (oldest) past-due fire time.
    Earliest,
    /// Keep only the most recent past-due fire time.
    Latest,
    /// Keep every past-due fire time, emitting one job per.
    All,
}

impl Default for CoalescePolicy {
    fn default() -> Self {
        CoalescePolicy::Latest
    }
}

/// What `add_schedule` does when a schedule with the same id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave the existing schedule untouched, return without error.
    DoNothing,
    /// Fail with `ConflictingIdError`.
    Exception,
    /// Overwrite the existing schedule in place.
    Replace,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::DoNothing
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Error,
    MissedStartDeadline,
    Cancelled,
}

/// Scheduler lifecycle state: `Stopped -> Starting -> Started -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// A named, reusable definition of what to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id, also the stable textual reference the worker resolves
    /// through its `TaskRegistry` (e.g. `"reports:send_weekly"`).
    pub id: String,
    /// Opaque callable reference; resolved by the worker, never by the store.
    pub func: String,
    /// At most this many jobs for this task may be acquired across the
    /// cluster at once. `None` means unlimited.
    pub max_running_jobs: Option<u32>,
    /// Maintained by the store; invariant: equals the number of this task's
    /// jobs currently leased by any worker.
    pub running_jobs: u32,
    /// Default grace period for jobs derived from this task, used when a
    /// schedule does not specify its own.
    #[serde(with = "duration_millis", default)]
    pub misfire_grace_time: Option<chrono::Duration>,
}

impl Task {
    pub fn new(id: impl Into<String>, func: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            func: func.into(),
            max_running_jobs: None,
            running_jobs: 0,
            misfire_grace_time: None,
        }
    }

    pub fn with_max_running_jobs(mut self, max: u32) -> Self {
        self.max_running_jobs = Some(max);
        self
    }

    pub fn with_misfire_grace_time(mut self, grace: chrono::Duration) -> Self {
        self.misfire_grace_time = Some(grace);
        self
    }
}

/// A recurring intent to create jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub task_id: String,
    pub trigger: Trigger,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub tags: HashSet<String>,
    pub coalesce: CoalescePolicy,
    #[serde(with = "duration_millis", default)]
    pub misfire_grace_time: Option<chrono::Duration>,
    /// Cached next trigger output; `None` means the schedule is exhausted.
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fire_time: Option<DateTime<Utc>>,
    pub acquired_by: Option<String>,
    pub acquired_until: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(id: impl Into<String>, task_id: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            trigger,
            args: serde_json::Value::Array(Vec::new()),
            kwargs: serde_json::Value::Object(serde_json::Map::new()),
            tags: HashSet::new(),
            coalesce: CoalescePolicy::default(),
            misfire_grace_time: None,
            next_fire_time: None,
            last_fire_time: None,
            acquired_by: None,
            acquired_until: None,
        }
    }

    pub fn with_coalesce(mut self, coalesce: CoalescePolicy) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn with_misfire_grace_time(mut self, grace: chrono::Duration) -> Self {
        self.misfire_grace_time = Some(grace);
        self
    }

    /// A schedule with no lease and no future fire time is dead weight; the
    /// store deletes it the next time it is released.
    pub fn is_exhausted(&self) -> bool {
        self.next_fire_time.is_none()
    }
}

/// A single pending or running execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: String,
    pub schedule_id: Option<String>,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub tags: HashSet<String>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub start_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub acquired_by: Option<String>,
    pub acquired_until: Option<DateTime<Utc>>,
}

impl Job {
    /// Build an ad-hoc job (no originating schedule), timestamped now.
    pub fn ad_hoc(task_id: impl Into<String>, args: serde_json::Value, kwargs: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            schedule_id: None,
            args,
            kwargs,
            tags: HashSet::new(),
            scheduled_fire_time: None,
            start_deadline: None,
            created_at: Utc::now(),
            acquired_by: None,
            acquired_until: None,
        }
    }
}

/// The terminal record of a job; consumed on read by `get_job_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub outcome: JobOutcome,
    pub finished_at: DateTime<Utc>,
    pub return_value: Option<serde_json::Value>,
    pub exception: Option<String>,
}

impl JobResult {
    pub fn success(job_id: Uuid, return_value: serde_json::Value) -> Self {
        Self {
            job_id,
            outcome: JobOutcome::Success,
            finished_at: Utc::now(),
            return_value: Some(return_value),
            exception: None,
        }
    }

    pub fn error(job_id: Uuid, exception: impl Into<String>) -> Self {
        Self {
            job_id,
            outcome: JobOutcome::Error,
            finished_at: Utc::now(),
            return_value: None,
            exception: Some(exception.into()),
        }
    }

    pub fn missed_start_deadline(job_id: Uuid) -> Self {
        Self {
            job_id,
            outcome: JobOutcome::MissedStartDeadline,
            finished_at: Utc::now(),
            return_value: None,
            exception: None,
        }
    }
}
