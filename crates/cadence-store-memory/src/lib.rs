//! An in-memory [`DataStore`] implementation. Intended for tests, demos, and
//! single-process deployments that don't need durability across restarts —
//! the PostgreSQL implementation in `cadence-store-postgres` is the
//! production-grade counterpart.
//!
//! Per-entity maps are lock-free (`dashmap`), but `acquire_schedules` and
//! `acquire_jobs` each need a single critical section spanning "read
//! candidates, then mark them leased" to give concurrent callers disjoint
//! results — a real single-process analogue of the source system's
//! `MemoryDataStore`, which guards the same two operations with one
//! `RLock`.
//!
//! `trigger`, `args`, `kwargs`, and `return_value` are kept internally as
//! the bytes produced by the configured [`Serializer`], not as native Rust
//! values, even though nothing outside this process ever reads them — this
//! is what makes the store generic over `S` rather than hardcoding
//! `serde_json`, and it means a row that fails to decode (because the
//! serializer changed, or is buggy) is caught the same way a real, shared
//! backend would catch it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::error::{ConflictingIdError, DeserializationError, StoreError, TaskLookupError};
use cadence_core::events::{Event, EventBroker};
use cadence_core::model::{ConflictPolicy, CoalescePolicy, Job, JobOutcome, JobResult, Schedule, Task};
use cadence_core::serializer::{JsonSerializer, Serializer};
use cadence_core::store::DataStore;
use cadence_core::trigger::Trigger;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Constructor options recognized by every store backend (spec §6).
#[derive(Debug, Clone)]
pub struct MemoryDataStoreOptions<S: Serializer = JsonSerializer> {
    pub lock_expiration_delay: chrono::Duration,
    /// The codec used for every opaque field (`trigger`, `args`, `kwargs`,
    /// `return_value`) this store instance persists. Fixed for the store's
    /// lifetime; every participant sharing a store must agree on it.
    pub serializer: S,
}

impl<S: Serializer + Default> Default for MemoryDataStoreOptions<S> {
    fn default() -> Self {
        Self {
            lock_expiration_delay: chrono::Duration::seconds(30),
            serializer: S::default(),
        }
    }
}

#[derive(Clone)]
struct StoredSchedule {
    id: String,
    task_id: String,
    trigger: Vec<u8>,
    args: Vec<u8>,
    kwargs: Vec<u8>,
    tags: std::collections::HashSet<String>,
    coalesce: CoalescePolicy,
    misfire_grace_time: Option<chrono::Duration>,
    next_fire_time: Option<DateTime<Utc>>,
    last_fire_time: Option<DateTime<Utc>>,
    acquired_by: Option<String>,
    acquired_until: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct StoredJob {
    id: Uuid,
    task_id: String,
    schedule_id: Option<String>,
    args: Vec<u8>,
    kwargs: Vec<u8>,
    tags: std::collections::HashSet<String>,
    scheduled_fire_time: Option<DateTime<Utc>>,
    start_deadline: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    acquired_by: Option<String>,
    acquired_until: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct StoredJobResult {
    job_id: Uuid,
    outcome: JobOutcome,
    finished_at: DateTime<Utc>,
    return_value: Option<Vec<u8>>,
    exception: Option<String>,
}

pub struct MemoryDataStore<S: Serializer = JsonSerializer> {
    options: MemoryDataStoreOptions<S>,
    events: Arc<EventBroker>,
    tasks: DashMap<String, Task>,
    schedules: DashMap<String, StoredSchedule>,
    jobs: DashMap<Uuid, StoredJob>,
    job_results: DashMap<Uuid, StoredJobResult>,
    schedule_lock: tokio::sync::Mutex<()>,
    job_lock: tokio::sync::Mutex<()>,
}

impl MemoryDataStore<JsonSerializer> {
    pub fn new() -> Arc<Self> {
        Self::with_options(MemoryDataStoreOptions::default())
    }
}

impl<S: Serializer + 'static> MemoryDataStore<S> {
    pub fn with_options(options: MemoryDataStoreOptions<S>) -> Arc<Self> {
        Arc::new(Self {
            options,
            events: EventBroker::new(),
            tasks: DashMap::new(),
            schedules: DashMap::new(),
            jobs: DashMap::new(),
            job_results: DashMap::new(),
            schedule_lock: tokio::sync::Mutex::new(()),
            job_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn publish(&self, build: impl FnOnce(cadence_core::events::EventMeta) -> Event) {
        let meta = self.events.next_meta();
        self.events.publish(build(meta));
    }

    fn encode_schedule(&self, schedule: &Schedule) -> Result<StoredSchedule, StoreError> {
        Ok(StoredSchedule {
            id: schedule.id.clone(),
            task_id: schedule.task_id.clone(),
            trigger: self.options.serializer.serialize(&schedule.trigger)?,
            args: self.options.serializer.serialize(&schedule.args)?,
            kwargs: self.options.serializer.serialize(&schedule.kwargs)?,
            tags: schedule.tags.clone(),
            coalesce: schedule.coalesce,
            misfire_grace_time: schedule.misfire_grace_time,
            next_fire_time: schedule.next_fire_time,
            last_fire_time: schedule.last_fire_time,
            acquired_by: schedule.acquired_by.clone(),
            acquired_until: schedule.acquired_until,
        })
    }

    fn decode_schedule(&self, stored: &StoredSchedule) -> Result<Schedule, DeserializationError> {
        let trigger: Trigger = self.options.serializer.deserialize(&stored.trigger)?;
        let args: serde_json::Value = self.options.serializer.deserialize(&stored.args)?;
        let kwargs: serde_json::Value = self.options.serializer.deserialize(&stored.kwargs)?;
        Ok(Schedule {
            id: stored.id.clone(),
            task_id: stored.task_id.clone(),
            trigger,
            args,
            kwargs,
            tags: stored.tags.clone(),
            coalesce: stored.coalesce,
            misfire_grace_time: stored.misfire_grace_time,
            next_fire_time: stored.next_fire_time,
            last_fire_time: stored.last_fire_time,
            acquired_by: stored.acquired_by.clone(),
            acquired_until: stored.acquired_until,
        })
    }

    fn decode_schedule_or_log(&self, stored: &StoredSchedule) -> Option<Schedule> {
        match self.decode_schedule(stored) {
            Ok(schedule) => Some(schedule),
            Err(error) => {
                tracing::error!(schedule_id = %stored.id, %error, "failed to deserialize schedule, skipping");
                let schedule_id = stored.id.clone();
                self.publish(|meta| Event::ScheduleDeserializationFailed {
                    meta,
                    schedule_id,
                    error: error.0,
                });
                None
            }
        }
    }

    fn encode_job(&self, job: &Job) -> Result<StoredJob, StoreError> {
        Ok(StoredJob {
            id: job.id,
            task_id: job.task_id.clone(),
            schedule_id: job.schedule_id.clone(),
            args: self.options.serializer.serialize(&job.args)?,
            kwargs: self.options.serializer.serialize(&job.kwargs)?,
            tags: job.tags.clone(),
            scheduled_fire_time: job.scheduled_fire_time,
            start_deadline: job.start_deadline,
            created_at: job.created_at,
            acquired_by: job.acquired_by.clone(),
            acquired_until: job.acquired_until,
        })
    }

    fn decode_job(&self, stored: &StoredJob) -> Result<Job, DeserializationError> {
        let args: serde_json::Value = self.options.serializer.deserialize(&stored.args)?;
        let kwargs: serde_json::Value = self.options.serializer.deserialize(&stored.kwargs)?;
        Ok(Job {
            id: stored.id,
            task_id: stored.task_id.clone(),
            schedule_id: stored.schedule_id.clone(),
            args,
            kwargs,
            tags: stored.tags.clone(),
            scheduled_fire_time: stored.scheduled_fire_time,
            start_deadline: stored.start_deadline,
            created_at: stored.created_at,
            acquired_by: stored.acquired_by.clone(),
            acquired_until: stored.acquired_until,
        })
    }

    fn decode_job_or_log(&self, stored: &StoredJob) -> Option<Job> {
        match self.decode_job(stored) {
            Ok(job) => Some(job),
            Err(error) => {
                tracing::error!(job_id = %stored.id, %error, "failed to deserialize job, skipping");
                let job_id = stored.id;
                self.publish(|meta| Event::JobDeserializationFailed { meta, job_id, error: error.0 });
                None
            }
        }
    }

    fn encode_job_result(&self, result: &JobResult) -> Result<StoredJobResult, StoreError> {
        let return_value = match &result.return_value {
            Some(value) => Some(self.options.serializer.serialize(value)?),
            None => None,
        };
        Ok(StoredJobResult {
            job_id: result.job_id,
            outcome: result.outcome,
            finished_at: result.finished_at,
            return_value,
            exception: result.exception.clone(),
        })
    }

    fn decode_job_result(&self, stored: &StoredJobResult) -> Result<JobResult, DeserializationError> {
        let return_value = match &stored.return_value {
            Some(bytes) => Some(self.options.serializer.deserialize(bytes)?),
            None => None,
        };
        Ok(JobResult {
            job_id: stored.job_id,
            outcome: stored.outcome,
            finished_at: stored.finished_at,
            return_value,
            exception: stored.exception.clone(),
        })
    }
}

#[async_trait]
impl<S: Serializer + 'static> DataStore for MemoryDataStore<S> {
    fn events(&self) -> Arc<EventBroker> {
        Arc::clone(&self.events)
    }

    async fn add_task(&self, mut task: Task) -> Result<(), StoreError> {
        let is_update = match self.tasks.get(&task.id) {
            Some(existing) => {
                task.running_jobs = existing.running_jobs;
                true
            }
            None => {
                task.running_jobs = 0;
                false
            }
        };
        let task_id = task.id.clone();
        self.tasks.insert(task_id.clone(), task);

        if is_update {
            self.publish(|meta| Event::TaskUpdated { meta, task_id });
        } else {
            self.publish(|meta| Event::TaskAdded { meta, task_id });
        }
        Ok(())
    }

    async fn remove_task(&self, id: &str) -> Result<(), StoreError> {
        match self.tasks.remove(id) {
            Some(_) => {
                let task_id = id.to_string();
                self.publish(|meta| Event::TaskRemoved { meta, task_id });
                Ok(())
            }
            None => Err(TaskLookupError(id.to_string()).into()),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.tasks
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| TaskLookupError(id.to_string()).into())
    }

    async fn get_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn add_schedule(
        &self,
        schedule: Schedule,
        conflict_policy: ConflictPolicy,
    ) -> Result<(), StoreError> {
        let _guard = self.schedule_lock.lock().await;

        let exists = self.schedules.contains_key(&schedule.id);
        if exists {
            match conflict_policy {
                ConflictPolicy::DoNothing => return Ok(()),
                ConflictPolicy::Exception => return Err(ConflictingIdError(schedule.id.clone()).into()),
                ConflictPolicy::Replace => {}
            }
        }

        let schedule_id = schedule.id.clone();
        let next_fire_time = schedule.next_fire_time;
        let stored = self.encode_schedule(&schedule)?;
        self.schedules.insert(schedule_id.clone(), stored);

        if exists {
            self.publish(|meta| Event::ScheduleUpdated { meta, schedule_id, next_fire_time });
        } else {
            self.publish(|meta| Event::ScheduleAdded { meta, schedule_id, next_fire_time });
        }
        Ok(())
    }

    async fn remove_schedules(&self, ids: &[String]) -> Result<(), StoreError> {
        let _guard = self.schedule_lock.lock().await;
        for id in ids {
            if self.schedules.remove(id).is_some() {
                let schedule_id = id.clone();
                self.publish(|meta| Event::ScheduleRemoved { meta, schedule_id });
            }
        }
        Ok(())
    }

    async fn get_schedules(&self, ids: Option<&[String]>) -> Result<Vec<Schedule>, StoreError> {
        let stored: Vec<StoredSchedule> = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.schedules.get(id).map(|s| s.clone()))
                .collect(),
            None => self.schedules.iter().map(|entry| entry.value().clone()).collect(),
        };
        let mut schedules: Vec<Schedule> = stored
            .iter()
            .filter_map(|s| self.decode_schedule_or_log(s))
            .collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    async fn acquire_schedules(
        &self,
        scheduler_id: &str,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError> {
        let _guard = self.schedule_lock.lock().await;
        let now = Utc::now();
        let acquired_until = now + self.options.lock_expiration_delay;

        let mut ready: Vec<(String, Option<DateTime<Utc>>)> = self
            .schedules
            .iter()
            .filter_map(|entry| {
                let stored = entry.value();
                let due = stored.next_fire_time.map_or(false, |t| t <= now);
                let leaseable = stored.acquired_until.map_or(true, |until| until < now);
                (due && leaseable).then(|| (stored.id.clone(), stored.next_fire_time))
            })
            .collect();

        ready.sort_by(|a, b| match (a.1, b.1) {
            (Some(at), Some(bt)) => at.cmp(&bt).then_with(|| a.0.cmp(&b.0)),
            _ => CmpOrdering::Equal,
        });
        ready.truncate(limit);

        let mut candidates = Vec::with_capacity(ready.len());
        for (id, _) in ready {
            let Some(stored) = self.schedules.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            if let Some(schedule) = self.decode_schedule_or_log(&stored) {
                candidates.push(schedule);
            }
        }

        for schedule in &candidates {
            if let Some(mut entry) = self.schedules.get_mut(&schedule.id) {
                entry.acquired_by = Some(scheduler_id.to_string());
                entry.acquired_until = Some(acquired_until);
            }
        }

        Ok(candidates
            .into_iter()
            .map(|mut schedule| {
                schedule.acquired_by = Some(scheduler_id.to_string());
                schedule.acquired_until = Some(acquired_until);
                schedule
            })
            .collect())
    }

    async fn release_schedules(
        &self,
        scheduler_id: &str,
        schedules: Vec<Schedule>,
    ) -> Result<(), StoreError> {
        let _guard = self.schedule_lock.lock().await;
        let mut events = Vec::new();

        for mut schedule in schedules {
            let current_owner = self
                .schedules
                .get(&schedule.id)
                .and_then(|s| s.acquired_by.clone());
            if current_owner.as_deref() != Some(scheduler_id) {
                // Lease expired and was reacquired by someone else; don't clobber it.
                continue;
            }

            if schedule.is_exhausted() {
                self.schedules.remove(&schedule.id);
                events.push(Event::ScheduleRemoved {
                    meta: self.events.next_meta(),
                    schedule_id: schedule.id.clone(),
                });
                continue;
            }

            schedule.acquired_by = None;
            schedule.acquired_until = None;

            match self.encode_schedule(&schedule) {
                Ok(stored) => {
                    let schedule_id = schedule.id.clone();
                    let next_fire_time = schedule.next_fire_time;
                    self.schedules.insert(schedule_id.clone(), stored);
                    events.push(Event::ScheduleUpdated {
                        meta: self.events.next_meta(),
                        schedule_id,
                        next_fire_time,
                    });
                }
                Err(error) => {
                    tracing::error!(
                        schedule_id = %schedule.id,
                        %error,
                        "failed to re-serialize trigger on release, removing schedule"
                    );
                    self.schedules.remove(&schedule.id);
                    events.push(Event::ScheduleRemoved {
                        meta: self.events.next_meta(),
                        schedule_id: schedule.id.clone(),
                    });
                }
            }
        }

        for event in events {
            self.events.publish(event);
        }
        Ok(())
    }

    async fn get_next_schedule_run_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let min = self
            .schedules
            .iter()
            .filter_map(|entry| entry.value().next_fire_time)
            .min();
        Ok(min)
    }

    async fn add_job(&self, job: Job) -> Result<(), StoreError> {
        let job_id = job.id;
        let task_id = job.task_id.clone();
        let schedule_id = job.schedule_id.clone();
        let tags = job.tags.clone();
        let stored = self.encode_job(&job)?;
        self.jobs.insert(job_id, stored);
        self.publish(|meta| Event::JobAdded {
            meta,
            job_id,
            task_id,
            schedule_id,
            tags,
        });
        Ok(())
    }

    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> Result<Vec<Job>, StoreError> {
        let stored: Vec<StoredJob> = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.jobs.get(id).map(|j| j.clone()))
                .collect(),
            None => self.jobs.iter().map(|entry| entry.value().clone()).collect(),
        };
        let mut jobs: Vec<Job> = stored.iter().filter_map(|j| self.decode_job_or_log(j)).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn acquire_jobs(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let _guard = self.job_lock.lock().await;
        let now = Utc::now();
        let acquired_until = now + self.options.lock_expiration_delay;

        let mut leaseable: Vec<StoredJob> = self
            .jobs
            .iter()
            .filter_map(|entry| {
                let job = entry.value();
                let leaseable = job.acquired_until.map_or(true, |until| until < now);
                leaseable.then(|| job.clone())
            })
            .collect();
        leaseable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        leaseable.truncate(limit);

        // Decode before admission: a row that fails to decode was never
        // really leaseable, so it must not consume a `max_running_jobs` slot
        // or increment the counter it's about to be excluded from.
        let decoded: Vec<Job> = leaseable.iter().filter_map(|j| self.decode_job_or_log(j)).collect();

        let mut slots_left: HashMap<String, i64> = HashMap::new();
        let mut admitted = Vec::with_capacity(decoded.len());
        let mut increments: HashMap<String, u32> = HashMap::new();

        for job in decoded {
            let task = match self.tasks.get(&job.task_id) {
                Some(task) => task.clone(),
                None => continue, // orphaned job; leave it for a future acquisition
            };

            if let Some(max) = task.max_running_jobs {
                let remaining = *slots_left
                    .entry(job.task_id.clone())
                    .or_insert_with(|| max as i64 - task.running_jobs as i64);
                if remaining <= 0 {
                    continue;
                }
                slots_left.insert(job.task_id.clone(), remaining - 1);
            }

            *increments.entry(job.task_id.clone()).or_insert(0) += 1;
            admitted.push(job);
        }

        for job in &admitted {
            if let Some(mut entry) = self.jobs.get_mut(&job.id) {
                entry.acquired_by = Some(worker_id.to_string());
                entry.acquired_until = Some(acquired_until);
            }
        }

        for (task_id, increment) in &increments {
            if let Some(mut task) = self.tasks.get_mut(task_id) {
                task.running_jobs += increment;
            }
        }

        for job in &admitted {
            self.publish(|meta| Event::JobAcquired {
                meta,
                job_id: job.id,
                worker_id: worker_id.to_string(),
            });
        }

        Ok(admitted
            .into_iter()
            .map(|mut job| {
                job.acquired_by = Some(worker_id.to_string());
                job.acquired_until = Some(acquired_until);
                job
            })
            .collect())
    }

    async fn release_job(
        &self,
        worker_id: &str,
        task_id: &str,
        result: JobResult,
    ) -> Result<(), StoreError> {
        let job_id = result.job_id;
        let outcome = result.outcome;
        let stored = self.encode_job_result(&result)?;

        // Idempotent: a missing job is a no-op, the result's key prevents
        // double insertion on a re-release.
        self.job_results.entry(job_id).or_insert(stored);
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.running_jobs = task.running_jobs.saturating_sub(1);
        }
        self.jobs.remove(&job_id);

        self.publish(|meta| Event::JobReleased {
            meta,
            job_id,
            worker_id: worker_id.to_string(),
            outcome,
        });
        Ok(())
    }

    async fn get_job_result(&self, job_id: Uuid) -> Result<Option<JobResult>, StoreError> {
        let stored = match self.job_results.remove(&job_id).map(|(_, v)| v) {
            Some(stored) => stored,
            None => return Ok(None),
        };

        match self.decode_job_result(&stored) {
            Ok(result) => Ok(Some(result)),
            Err(error) => {
                tracing::error!(job_id = %job_id, %error, "failed to deserialize job result, dropping it");
                self.publish(|meta| Event::JobDeserializationFailed {
                    meta,
                    job_id,
                    error: error.0,
                });
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests;
