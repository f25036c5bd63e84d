//! Turns schedules into jobs on time (spec §4.1).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{JobLookupError, StoreError};
use crate::events::{Event, EventKind};
use crate::model::{CoalescePolicy, ConflictPolicy, Job, JobOutcome, JobResult, RunState, Schedule, Task};
use crate::store::DataStore;
use crate::trigger::Trigger;

const ACQUIRE_BATCH: usize = 100;

/// Options accepted by [`Scheduler::add_schedule`]. Mirrors the constructor
/// keyword arguments of the source system's `add_schedule`.
#[derive(Debug, Clone, Default)]
pub struct AddScheduleOptions {
    pub id: Option<String>,
    pub args: Option<serde_json::Value>,
    pub kwargs: Option<serde_json::Value>,
    pub tags: HashSet<String>,
    pub coalesce: CoalescePolicy,
    pub misfire_grace_time: Option<chrono::Duration>,
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    pub args: Option<serde_json::Value>,
    pub kwargs: Option<serde_json::Value>,
    pub tags: HashSet<String>,
}

fn run_state_from_u8(value: u8) -> RunState {
    match value {
        0 => RunState::Stopped,
        1 => RunState::Starting,
        2 => RunState::Started,
        _ => RunState::Stopping,
    }
}

/// `stopped -> starting -> started -> stopping -> stopped`.
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

pub struct Scheduler {
    identity: String,
    store: Arc<dyn DataStore>,
    state: AtomicRunState,
    wakeup: Arc<Notify>,
    last_batch_size: AtomicUsize,
}

impl Scheduler {
    pub fn new(identity: impl Into<String>, store: Arc<dyn DataStore>) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            store,
            state: AtomicRunState::new(),
            wakeup: Arc::new(Notify::new()),
            last_batch_size: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Add a recurring schedule for an existing task. Computes the first
    /// `next_fire_time` from the trigger before persisting.
    pub async fn add_schedule(
        &self,
        task_id: impl Into<String>,
        mut trigger: Trigger,
        opts: AddScheduleOptions,
    ) -> Result<String, StoreError> {
        let id = opts.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let next_fire_time = trigger.next().map_err(StoreError::Backend)?;

        let mut schedule = Schedule::new(id.clone(), task_id, trigger);
        schedule.args = opts.args.unwrap_or_else(|| serde_json::json!([]));
        schedule.kwargs = opts.kwargs.unwrap_or_else(|| serde_json::json!({}));
        schedule.tags = opts.tags;
        schedule.coalesce = opts.coalesce;
        schedule.misfire_grace_time = opts.misfire_grace_time;
        schedule.next_fire_time = next_fire_time;

        self.store.add_schedule(schedule, opts.conflict_policy).await?;
        Ok(id)
    }

    pub async fn remove_schedule(&self, id: &str) -> Result<(), StoreError> {
        self.store.remove_schedules(&[id.to_string()]).await
    }

    /// Ad-hoc enqueue bypassing any schedule.
    pub async fn add_job(
        &self,
        task_id: impl Into<String>,
        opts: AddJobOptions,
    ) -> Result<Uuid, StoreError> {
        let mut job = Job::ad_hoc(
            task_id,
            opts.args.unwrap_or_else(|| serde_json::json!([])),
            opts.kwargs.unwrap_or_else(|| serde_json::json!({})),
        );
        job.tags = opts.tags;
        let job_id = job.id;
        self.store.add_job(job).await?;
        Ok(job_id)
    }

    /// Subscribes to `JobReleased` *before* checking the store, eliminating
    /// the lost-wakeup race between "check for a result" and "the job
    /// finishes right after we checked".
    pub async fn get_job_result(&self, job_id: Uuid, wait: bool) -> Result<JobResult, StoreError> {
        let notify = Arc::new(Notify::new());
        let notify_clone = Arc::clone(&notify);
        let mut kinds = HashSet::new();
        kinds.insert(EventKind::JobReleased);

        let _subscription = self.store.events().subscribe(Some(kinds), false, move |event| {
            if let Event::JobReleased { job_id: released_id, .. } = event {
                if *released_id == job_id {
                    notify_clone.notify_one();
                }
            }
        });

        if let Some(result) = self.store.get_job_result(job_id).await? {
            return Ok(result);
        }
        if !wait {
            return Err(StoreError::JobLookup(JobLookupError(job_id)));
        }

        notify.notified().await;

        self.store
            .get_job_result(job_id)
            .await?
            .ok_or(StoreError::JobLookup(JobLookupError(job_id)))
    }

    /// Add a job, wait for it to finish, and unwrap its outcome.
    pub async fn run_job(
        &self,
        task_id: impl Into<String>,
        opts: AddJobOptions,
    ) -> Result<serde_json::Value, JobRunError> {
        let job_id = self.add_job(task_id, opts).await?;
        let result = self.get_job_result(job_id, true).await?;
        match result.outcome {
            JobOutcome::Success => Ok(result.return_value.unwrap_or(serde_json::Value::Null)),
            JobOutcome::Error => Err(JobRunError::Raised(result.exception.unwrap_or_default())),
            JobOutcome::MissedStartDeadline => Err(JobRunError::MissedStartDeadline),
            JobOutcome::Cancelled => Err(JobRunError::Cancelled),
        }
    }

    /// Signals the wakeup event and moves to `stopping`; in-flight
    /// `acquire_*` calls complete normally, then `run` returns. Leases held
    /// at this point are left to expire naturally.
    pub fn stop(&self) {
        self.state.set(RunState::Stopping);
        self.wakeup.notify_one();
    }

    /// The scheduler's main loop. Only runs while state is `Started`.
    pub async fn run(self: Arc<Self>) -> Result<(), StoreError> {
        if self.state.get() != RunState::Stopped {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "scheduler cannot run: state is {:?}, expected Stopped",
                self.state.get()
            )));
        }
        self.state.set(RunState::Starting);

        let mut wakeup_kinds = HashSet::new();
        wakeup_kinds.insert(EventKind::ScheduleAdded);
        wakeup_kinds.insert(EventKind::ScheduleUpdated);
        let wakeup = Arc::clone(&self.wakeup);
        let _wakeup_subscription =
            self.store
                .events()
                .subscribe(Some(wakeup_kinds), false, move |_event| {
                    wakeup.notify_one();
                });

        self.state.set(RunState::Started);
        let meta = self.store.events().next_meta();
        self.store.events().publish(Event::SchedulerStarted { meta });

        let result = self.run_loop(&self.wakeup).await;

        self.state.set(RunState::Stopped);
        let meta = self.store.events().next_meta();
        let error = result.as_ref().err().map(|e| e.to_string());
        self.store
            .events()
            .publish(Event::SchedulerStopped { meta, error });

        result
    }

    async fn run_loop(&self, wakeup_notify: &Notify) -> Result<(), StoreError> {
        while self.state.get() == RunState::Started {
            self.tick().await?;

            if self.state.get() != RunState::Started {
                break;
            }

            let schedules_returned = self.last_batch_size.load(Ordering::SeqCst);
            if schedules_returned < ACQUIRE_BATCH {
                let next_run = self.store.get_next_schedule_run_time().await?;
                match next_run {
                    Some(next_run) => {
                        let now = Utc::now();
                        let wait = (next_run - now).to_std().unwrap_or(std::time::Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {},
                            _ = wakeup_notify.notified() => {},
                        }
                    }
                    None => {
                        wakeup_notify.notified().await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn tick(&self) -> Result<(), StoreError> {
        let schedules = self.store.acquire_schedules(&self.identity, ACQUIRE_BATCH).await?;
        self.last_batch_size.store(schedules.len(), Ordering::SeqCst);

        let now = Utc::now();
        let mut released = Vec::with_capacity(schedules.len());

        for mut schedule in schedules {
            let mut fire_times = match schedule.next_fire_time {
                Some(t) => vec![t],
                None => {
                    released.push(schedule);
                    continue;
                }
            };

            loop {
                match schedule.trigger.next() {
                    Ok(Some(fire_time)) if fire_time <= now => {
                        fire_times.push(fire_time);
                    }
                    Ok(next) => {
                        schedule.next_fire_time = next;
                        break;
                    }
                    Err(error) => {
                        tracing::error!(
                            schedule_id = %schedule.id,
                            task_id = %schedule.task_id,
                            %error,
                            "error computing next fire time for schedule, removing it"
                        );
                        schedule.next_fire_time = None;
                        break;
                    }
                }
            }

            let coalesced: Vec<DateTime<Utc>> = match schedule.coalesce {
                CoalescePolicy::Earliest => vec![fire_times[0]],
                CoalescePolicy::Latest => vec![*fire_times.last().expect("fire_times never empty")],
                CoalescePolicy::All => fire_times,
            };

            // Looked up once per schedule, not once per coalesced fire time.
            // A schedule whose task was deleted out from under it must not
            // take the whole scheduler down with it: log, drop this one
            // schedule, and keep ticking the rest.
            let task = match self.store.get_task(&schedule.task_id).await {
                Ok(task) => task,
                Err(error) => {
                    tracing::error!(
                        schedule_id = %schedule.id,
                        task_id = %schedule.task_id,
                        %error,
                        "schedule references a task that no longer exists, removing it"
                    );
                    schedule.next_fire_time = None;
                    released.push(schedule);
                    continue;
                }
            };

            for fire_time in &coalesced {
                schedule.last_fire_time = Some(*fire_time);
                let job = self.job_for_fire_time(&schedule, &task, *fire_time);
                self.store.add_job(job).await?;
            }

            tracing::info!(
                schedule_id = %schedule.id,
                jobs_produced = coalesced.len(),
                next_fire_time = ?schedule.next_fire_time,
                "scheduler tick produced jobs"
            );

            released.push(schedule);
        }

        self.store.release_schedules(&self.identity, released).await?;
        Ok(())
    }

    /// Exposes a single tick without the sleep loop, for tests in
    /// `scheduler_tests` that assert on one batch of produced jobs.
    #[cfg(test)]
    pub(crate) async fn tick_once_for_test(&self) {
        self.tick().await.unwrap();
    }

    fn job_for_fire_time(&self, schedule: &Schedule, task: &Task, fire_time: DateTime<Utc>) -> Job {
        let grace = schedule.misfire_grace_time.or(task.misfire_grace_time);
        Job {
            id: Uuid::new_v4(),
            task_id: schedule.task_id.clone(),
            schedule_id: Some(schedule.id.clone()),
            args: schedule.args.clone(),
            kwargs: schedule.kwargs.clone(),
            tags: schedule.tags.clone(),
            scheduled_fire_time: Some(fire_time),
            start_deadline: grace.map(|g| fire_time + g),
            created_at: Utc::now(),
            acquired_by: None,
            acquired_until: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobRunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job raised: {0}")]
    Raised(String),
    #[error("job missed its start deadline")]
    MissedStartDeadline,
    #[error("job was cancelled")]
    Cancelled,
}
