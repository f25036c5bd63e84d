//! The data store contract (spec §4.3). One interface, several tagged
//! implementations (in-memory, PostgreSQL) — operations are synchronous in
//! the sense of "one transaction, fully visible or not at all"; the trait
//! itself is `async` because every implementation does real I/O.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::events::EventBroker;
use crate::model::{ConflictPolicy, Job, JobResult, Schedule, Task};
use std::sync::Arc;

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Handle to this store's event broker. Shared by every caller holding
    /// this store, so the scheduler and worker see the same event stream.
    fn events(&self) -> Arc<EventBroker>;

    async fn add_task(&self, task: Task) -> Result<(), StoreError>;
    async fn remove_task(&self, id: &str) -> Result<(), StoreError>;
    async fn get_task(&self, id: &str) -> Result<Task, StoreError>;
    async fn get_tasks(&self) -> Result<Vec<Task>, StoreError>;

    async fn add_schedule(
        &self,
        schedule: Schedule,
        conflict_policy: ConflictPolicy,
    ) -> Result<(), StoreError>;
    async fn remove_schedules(&self, ids: &[String]) -> Result<(), StoreError>;
    async fn get_schedules(&self, ids: Option<&[String]>) -> Result<Vec<Schedule>, StoreError>;

    /// Atomically select up to `limit` due, unleased (or lease-expired)
    /// schedules, mark them leased to `scheduler_id`, and return them.
    async fn acquire_schedules(
        &self,
        scheduler_id: &str,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError>;

    /// For each schedule: delete it if exhausted, otherwise persist its
    /// advanced trigger state and `next_fire_time` and clear its lease. Only
    /// touches rows still leased to `scheduler_id`.
    async fn release_schedules(
        &self,
        scheduler_id: &str,
        schedules: Vec<Schedule>,
    ) -> Result<(), StoreError>;

    async fn get_next_schedule_run_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn add_job(&self, job: Job) -> Result<(), StoreError>;
    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> Result<Vec<Job>, StoreError>;

    /// Atomically select unleased (or lease-expired) jobs in `created_at`
    /// order, admit them against each referenced task's `max_running_jobs`,
    /// and mark admitted jobs leased to `worker_id`.
    async fn acquire_jobs(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Atomically insert `result`, decrement `task_id`'s `running_jobs`, and
    /// delete the job row. A missing job is a no-op (idempotent re-release).
    async fn release_job(
        &self,
        worker_id: &str,
        task_id: &str,
        result: JobResult,
    ) -> Result<(), StoreError>;

    /// Consuming read: fetch and delete the result row in one step.
    async fn get_job_result(&self, job_id: Uuid) -> Result<Option<JobResult>, StoreError>;
}
