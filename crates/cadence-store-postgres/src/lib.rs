//! PostgreSQL implementation of [`DataStore`](cadence_core::store::DataStore).
//!
//! Built on `sqlx` against plain SQL — no ORM, no migrations framework —
//! following the same direct-query style as the rest of this stack. Batch
//! claiming (`acquire_schedules`, `acquire_jobs`) uses a
//! `FOR UPDATE SKIP LOCKED` CTE so concurrent schedulers/workers sharing one
//! database never see overlapping rows, matching the lease contract the
//! in-memory store enforces with a mutex.
//!
//! # Schema
//!
//! `trigger`, `args`, `kwargs`, and `return_value` are opaque bytes produced
//! by the configured [`Serializer`](cadence_core::serializer::Serializer),
//! not JSON the database ever inspects — hence `BYTEA`, not `JSONB`.
//!
//! ```sql
//! CREATE TABLE cadence_tasks (
//!     id TEXT PRIMARY KEY,
//!     func TEXT NOT NULL,
//!     max_running_jobs INTEGER,
//!     running_jobs INTEGER NOT NULL DEFAULT 0,
//!     misfire_grace_time_ms BIGINT
//! );
//!
//! CREATE TABLE cadence_schedules (
//!     id TEXT PRIMARY KEY,
//!     task_id TEXT NOT NULL REFERENCES cadence_tasks (id),
//!     trigger BYTEA NOT NULL,
//!     args BYTEA NOT NULL,
//!     kwargs BYTEA NOT NULL,
//!     tags TEXT[] NOT NULL DEFAULT '{}',
//!     coalesce_policy TEXT NOT NULL,
//!     misfire_grace_time_ms BIGINT,
//!     next_fire_time TIMESTAMPTZ,
//!     last_fire_time TIMESTAMPTZ,
//!     acquired_by TEXT,
//!     acquired_until TIMESTAMPTZ
//! );
//! CREATE INDEX cadence_schedules_next_fire_time ON cadence_schedules (next_fire_time);
//!
//! CREATE TABLE cadence_jobs (
//!     id UUID PRIMARY KEY,
//!     task_id TEXT NOT NULL REFERENCES cadence_tasks (id),
//!     schedule_id TEXT,
//!     args BYTEA NOT NULL,
//!     kwargs BYTEA NOT NULL,
//!     tags TEXT[] NOT NULL DEFAULT '{}',
//!     scheduled_fire_time TIMESTAMPTZ,
//!     start_deadline TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     acquired_by TEXT,
//!     acquired_until TIMESTAMPTZ
//! );
//! CREATE INDEX cadence_jobs_task_id ON cadence_jobs (task_id);
//! CREATE INDEX cadence_jobs_created_at ON cadence_jobs (created_at);
//!
//! CREATE TABLE cadence_job_results (
//!     job_id UUID PRIMARY KEY,
//!     outcome TEXT NOT NULL,
//!     finished_at TIMESTAMPTZ NOT NULL,
//!     return_value BYTEA,
//!     exception TEXT
//! );
//! CREATE INDEX cadence_job_results_finished_at ON cadence_job_results (finished_at);
//! ```
//!
//! # Notifications
//!
//! Every event this store publishes locally also triggers
//! `NOTIFY <notify_channel>` (empty payload) so other processes sharing this
//! database, and listening on the same channel, wake up promptly instead of
//! polling — listeners re-read the store for the actual event.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::error::{ConflictingIdError, DeserializationError, StoreError, TaskLookupError};
use cadence_core::events::{Event, EventBroker};
use cadence_core::model::{ConflictPolicy, Job, JobOutcome, JobResult, Schedule, Task};
use cadence_core::serializer::{JsonSerializer, Serializer};
use cadence_core::store::DataStore;
use cadence_core::trigger::Trigger;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Constructor options recognized by every store backend (spec §6).
#[derive(Debug, Clone)]
pub struct PostgresDataStoreOptions<S: Serializer = JsonSerializer> {
    pub lock_expiration_delay: chrono::Duration,
    /// Truncate every Cadence table at startup; for test fixtures only.
    pub start_from_scratch: bool,
    /// The codec used for every opaque field this store instance persists.
    /// Fixed for the store's lifetime; every participant sharing a store
    /// must agree on it.
    pub serializer: S,
    /// `LISTEN`/`NOTIFY` channel name this store's events are relayed on.
    pub notify_channel: String,
}

impl<S: Serializer + Default> Default for PostgresDataStoreOptions<S> {
    fn default() -> Self {
        Self {
            lock_expiration_delay: chrono::Duration::seconds(30),
            start_from_scratch: false,
            serializer: S::default(),
            notify_channel: "apscheduler".to_string(),
        }
    }
}

pub struct PostgresDataStore<S: Serializer = JsonSerializer> {
    pool: PgPool,
    options: PostgresDataStoreOptions<S>,
    events: Arc<EventBroker>,
}

impl PostgresDataStore<JsonSerializer> {
    pub async fn connect(database_url: &str) -> Result<Arc<Self>, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Self::new(pool, PostgresDataStoreOptions::default()).await
    }
}

impl<S: Serializer + 'static> PostgresDataStore<S> {
    pub async fn new(pool: PgPool, options: PostgresDataStoreOptions<S>) -> Result<Arc<Self>, StoreError> {
        let store = Self {
            pool,
            options,
            events: EventBroker::new(),
        };
        if store.options.start_from_scratch {
            store.truncate_all().await?;
        }
        Ok(Arc::new(store))
    }

    async fn truncate_all(&self) -> Result<(), StoreError> {
        sqlx::query(
            "TRUNCATE cadence_job_results, cadence_jobs, cadence_schedules, cadence_tasks CASCADE",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    fn publish(&self, build: impl FnOnce(cadence_core::events::EventMeta) -> Event) {
        let meta = self.events.next_meta();
        self.events.publish(build(meta));
        self.notify();
    }

    /// Best-effort relay; a dead connection here must never fail the
    /// operation that triggered it, since the write already committed.
    /// `sqlx::query` under `self.pool` round-trips a fresh connection per
    /// call, which is fine for the occasional `NOTIFY` — a dedicated
    /// `LISTEN`-holding connection is the listener's concern, not this
    /// store's. The payload is empty; listeners re-read the store for the
    /// actual event, `NOTIFY` is just the wakeup.
    fn notify(&self) {
        let pool = self.pool.clone();
        let channel = self.options.notify_channel.clone();
        tokio::spawn(async move {
            if let Err(error) = sqlx::query("SELECT pg_notify($1, '')").bind(&channel).execute(&pool).await
            {
                tracing::warn!(%error, channel, "failed to relay event via NOTIFY");
            }
        });
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
        let grace_ms: Option<i64> = row.try_get("misfire_grace_time_ms").map_err(sqlx_err)?;
        Ok(Task {
            id: row.try_get("id").map_err(sqlx_err)?,
            func: row.try_get("func").map_err(sqlx_err)?,
            max_running_jobs: row
                .try_get::<Option<i32>, _>("max_running_jobs")
                .map_err(sqlx_err)?
                .map(|v| v as u32),
            running_jobs: row.try_get::<i32, _>("running_jobs").map_err(sqlx_err)? as u32,
            misfire_grace_time: grace_ms.map(chrono::Duration::milliseconds),
        })
    }

    fn decode_schedule_row(&self, row: &sqlx::postgres::PgRow) -> Result<Schedule, DeserializationError> {
        let trigger_bytes: Vec<u8> = row
            .try_get("trigger")
            .map_err(|e| DeserializationError(e.to_string()))?;
        let trigger: Trigger = self.options.serializer.deserialize(&trigger_bytes)?;
        let args_bytes: Vec<u8> = row
            .try_get("args")
            .map_err(|e| DeserializationError(e.to_string()))?;
        let args: serde_json::Value = self.options.serializer.deserialize(&args_bytes)?;
        let kwargs_bytes: Vec<u8> = row
            .try_get("kwargs")
            .map_err(|e| DeserializationError(e.to_string()))?;
        let kwargs: serde_json::Value = self.options.serializer.deserialize(&kwargs_bytes)?;

        let coalesce_raw: String = row
            .try_get("coalesce_policy")
            .map_err(|e| DeserializationError(e.to_string()))?;
        let coalesce = match coalesce_raw.as_str() {
            "earliest" => cadence_core::model::CoalescePolicy::Earliest,
            "all" => cadence_core::model::CoalescePolicy::All,
            _ => cadence_core::model::CoalescePolicy::Latest,
        };
        let grace_ms: Option<i64> = row
            .try_get("misfire_grace_time_ms")
            .map_err(|e| DeserializationError(e.to_string()))?;
        let tags: Vec<String> = row.try_get("tags").map_err(|e| DeserializationError(e.to_string()))?;

        Ok(Schedule {
            id: row.try_get("id").map_err(|e| DeserializationError(e.to_string()))?,
            task_id: row
                .try_get("task_id")
                .map_err(|e| DeserializationError(e.to_string()))?,
            trigger,
            args,
            kwargs,
            tags: tags.into_iter().collect(),
            coalesce,
            misfire_grace_time: grace_ms.map(chrono::Duration::milliseconds),
            next_fire_time: row
                .try_get("next_fire_time")
                .map_err(|e| DeserializationError(e.to_string()))?,
            last_fire_time: row
                .try_get("last_fire_time")
                .map_err(|e| DeserializationError(e.to_string()))?,
            acquired_by: row
                .try_get("acquired_by")
                .map_err(|e| DeserializationError(e.to_string()))?,
            acquired_until: row
                .try_get("acquired_until")
                .map_err(|e| DeserializationError(e.to_string()))?,
        })
    }

    fn decode_schedule_row_or_log(&self, row: &sqlx::postgres::PgRow) -> Option<Schedule> {
        let id: Result<String, _> = row.try_get("id");
        match self.decode_schedule_row(row) {
            Ok(schedule) => Some(schedule),
            Err(error) => {
                let schedule_id = id.unwrap_or_default();
                tracing::error!(schedule_id, %error, "failed to deserialize schedule row, skipping");
                self.publish(|meta| Event::ScheduleDeserializationFailed {
                    meta,
                    schedule_id: schedule_id.clone(),
                    error: error.0.clone(),
                });
                None
            }
        }
    }

    fn decode_job_row(&self, row: &sqlx::postgres::PgRow) -> Result<Job, DeserializationError> {
        let args_bytes: Vec<u8> = row.try_get("args").map_err(|e| DeserializationError(e.to_string()))?;
        let args: serde_json::Value = self.options.serializer.deserialize(&args_bytes)?;
        let kwargs_bytes: Vec<u8> = row.try_get("kwargs").map_err(|e| DeserializationError(e.to_string()))?;
        let kwargs: serde_json::Value = self.options.serializer.deserialize(&kwargs_bytes)?;
        let tags: Vec<String> = row.try_get("tags").map_err(|e| DeserializationError(e.to_string()))?;

        Ok(Job {
            id: row.try_get("id").map_err(|e| DeserializationError(e.to_string()))?,
            task_id: row
                .try_get("task_id")
                .map_err(|e| DeserializationError(e.to_string()))?,
            schedule_id: row
                .try_get("schedule_id")
                .map_err(|e| DeserializationError(e.to_string()))?,
            args,
            kwargs,
            tags: tags.into_iter().collect(),
            scheduled_fire_time: row
                .try_get("scheduled_fire_time")
                .map_err(|e| DeserializationError(e.to_string()))?,
            start_deadline: row
                .try_get("start_deadline")
                .map_err(|e| DeserializationError(e.to_string()))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| DeserializationError(e.to_string()))?,
            acquired_by: row
                .try_get("acquired_by")
                .map_err(|e| DeserializationError(e.to_string()))?,
            acquired_until: row
                .try_get("acquired_until")
                .map_err(|e| DeserializationError(e.to_string()))?,
        })
    }

    fn decode_job_row_or_log(&self, row: &sqlx::postgres::PgRow) -> Option<Job> {
        let id: Result<Uuid, _> = row.try_get("id");
        match self.decode_job_row(row) {
            Ok(job) => Some(job),
            Err(error) => {
                if let Ok(job_id) = id {
                    tracing::error!(%job_id, %error, "failed to deserialize job row, skipping");
                    self.publish(|meta| Event::JobDeserializationFailed {
                        meta,
                        job_id,
                        error: error.0.clone(),
                    });
                }
                None
            }
        }
    }
}

fn sqlx_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.into())
}

fn coalesce_str(policy: cadence_core::model::CoalescePolicy) -> &'static str {
    match policy {
        cadence_core::model::CoalescePolicy::Earliest => "earliest",
        cadence_core::model::CoalescePolicy::Latest => "latest",
        cadence_core::model::CoalescePolicy::All => "all",
    }
}

fn outcome_str(outcome: JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Success => "success",
        JobOutcome::Error => "error",
        JobOutcome::MissedStartDeadline => "missed_start_deadline",
        JobOutcome::Cancelled => "cancelled",
    }
}

fn outcome_from_str(s: &str) -> JobOutcome {
    match s {
        "success" => JobOutcome::Success,
        "error" => JobOutcome::Error,
        "missed_start_deadline" => JobOutcome::MissedStartDeadline,
        _ => JobOutcome::Cancelled,
    }
}

#[async_trait]
impl<S: Serializer + 'static> DataStore for PostgresDataStore<S> {
    fn events(&self) -> Arc<EventBroker> {
        Arc::clone(&self.events)
    }

    async fn add_task(&self, task: Task) -> Result<(), StoreError> {
        let grace_ms = task.misfire_grace_time.map(|d| d.num_milliseconds());
        let row = sqlx::query(
            r#"
            INSERT INTO cadence_tasks (id, func, max_running_jobs, running_jobs, misfire_grace_time_ms)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (id) DO UPDATE
                SET func = EXCLUDED.func,
                    max_running_jobs = EXCLUDED.max_running_jobs,
                    misfire_grace_time_ms = EXCLUDED.misfire_grace_time_ms
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&task.id)
        .bind(&task.func)
        .bind(task.max_running_jobs.map(|v| v as i32))
        .bind(grace_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        let inserted: bool = row.try_get("inserted").map_err(sqlx_err)?;
        let task_id = task.id;
        if inserted {
            self.publish(|meta| Event::TaskAdded { meta, task_id });
        } else {
            self.publish(|meta| Event::TaskUpdated { meta, task_id });
        }
        Ok(())
    }

    async fn remove_task(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM cadence_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(TaskLookupError(id.to_string()).into());
        }
        let task_id = id.to_string();
        self.publish(|meta| Event::TaskRemoved { meta, task_id });
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM cadence_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?
            .ok_or_else(|| TaskLookupError(id.to_string()))?;
        Self::row_to_task(&row)
    }

    async fn get_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM cadence_tasks ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn add_schedule(
        &self,
        schedule: Schedule,
        conflict_policy: ConflictPolicy,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM cadence_schedules WHERE id = $1)")
            .bind(&schedule.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        if exists {
            match conflict_policy {
                ConflictPolicy::DoNothing => return Ok(()),
                ConflictPolicy::Exception => return Err(ConflictingIdError(schedule.id).into()),
                ConflictPolicy::Replace => {}
            }
        }

        let trigger_bytes = self.options.serializer.serialize(&schedule.trigger)?;
        let args_bytes = self.options.serializer.serialize(&schedule.args)?;
        let kwargs_bytes = self.options.serializer.serialize(&schedule.kwargs)?;
        let grace_ms = schedule.misfire_grace_time.map(|d| d.num_milliseconds());
        let tags: Vec<String> = schedule.tags.iter().cloned().collect();

        sqlx::query(
            r#"
            INSERT INTO cadence_schedules
                (id, task_id, trigger, args, kwargs, tags, coalesce_policy, misfire_grace_time_ms,
                 next_fire_time, last_fire_time, acquired_by, acquired_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE
                SET task_id = EXCLUDED.task_id,
                    trigger = EXCLUDED.trigger,
                    args = EXCLUDED.args,
                    kwargs = EXCLUDED.kwargs,
                    tags = EXCLUDED.tags,
                    coalesce_policy = EXCLUDED.coalesce_policy,
                    misfire_grace_time_ms = EXCLUDED.misfire_grace_time_ms,
                    next_fire_time = EXCLUDED.next_fire_time,
                    last_fire_time = EXCLUDED.last_fire_time,
                    acquired_by = NULL,
                    acquired_until = NULL
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.task_id)
        .bind(&trigger_bytes)
        .bind(&args_bytes)
        .bind(&kwargs_bytes)
        .bind(&tags)
        .bind(coalesce_str(schedule.coalesce))
        .bind(grace_ms)
        .bind(schedule.next_fire_time)
        .bind(schedule.last_fire_time)
        .bind(&schedule.acquired_by)
        .bind(schedule.acquired_until)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;

        let schedule_id = schedule.id;
        let next_fire_time = schedule.next_fire_time;
        if exists {
            self.publish(|meta| Event::ScheduleUpdated { meta, schedule_id, next_fire_time });
        } else {
            self.publish(|meta| Event::ScheduleAdded { meta, schedule_id, next_fire_time });
        }
        Ok(())
    }

    async fn remove_schedules(&self, ids: &[String]) -> Result<(), StoreError> {
        let removed: Vec<String> = sqlx::query_scalar(
            "DELETE FROM cadence_schedules WHERE id = ANY($1) RETURNING id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        for schedule_id in removed {
            self.publish(|meta| Event::ScheduleRemoved { meta, schedule_id });
        }
        Ok(())
    }

    async fn get_schedules(&self, ids: Option<&[String]>) -> Result<Vec<Schedule>, StoreError> {
        let rows = match ids {
            Some(ids) => sqlx::query("SELECT * FROM cadence_schedules WHERE id = ANY($1) ORDER BY id")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(sqlx_err)?,
            None => sqlx::query("SELECT * FROM cadence_schedules ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(sqlx_err)?,
        };
        Ok(rows.iter().filter_map(|row| self.decode_schedule_row_or_log(row)).collect())
    }

    async fn acquire_schedules(
        &self,
        scheduler_id: &str,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError> {
        let acquired_until = Utc::now() + self.options.lock_expiration_delay;

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM cadence_schedules
                WHERE next_fire_time <= NOW()
                  AND (acquired_until IS NULL OR acquired_until < NOW())
                ORDER BY next_fire_time ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE cadence_schedules
            SET acquired_by = $2,
                acquired_until = $3
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(limit as i64)
        .bind(scheduler_id)
        .bind(acquired_until)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(rows.iter().filter_map(|row| self.decode_schedule_row_or_log(row)).collect())
    }

    async fn release_schedules(
        &self,
        scheduler_id: &str,
        schedules: Vec<Schedule>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let mut events = Vec::new();

        for schedule in schedules {
            if schedule.is_exhausted() {
                let removed: Option<String> = sqlx::query_scalar(
                    "DELETE FROM cadence_schedules WHERE id = $1 AND acquired_by = $2 RETURNING id",
                )
                .bind(&schedule.id)
                .bind(scheduler_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(sqlx_err)?;
                if let Some(schedule_id) = removed {
                    events.push(Event::ScheduleRemoved { meta: self.events.next_meta(), schedule_id });
                }
                continue;
            }

            let trigger_bytes = match self.options.serializer.serialize(&schedule.trigger) {
                Ok(bytes) => bytes,
                Err(error) => {
                    // Can't persist the advanced trigger state; dropping the
                    // schedule beats silently re-running a stale one forever.
                    tracing::error!(schedule_id = %schedule.id, %error, "failed to serialize trigger on release, removing schedule");
                    sqlx::query("DELETE FROM cadence_schedules WHERE id = $1 AND acquired_by = $2")
                        .bind(&schedule.id)
                        .bind(scheduler_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(sqlx_err)?;
                    events.push(Event::ScheduleRemoved {
                        meta: self.events.next_meta(),
                        schedule_id: schedule.id.clone(),
                    });
                    continue;
                }
            };

            let updated: Option<String> = sqlx::query_scalar(
                r#"
                UPDATE cadence_schedules
                SET trigger = $1,
                    next_fire_time = $2,
                    last_fire_time = $3,
                    acquired_by = NULL,
                    acquired_until = NULL
                WHERE id = $4 AND acquired_by = $5
                RETURNING id
                "#,
            )
            .bind(&trigger_bytes)
            .bind(schedule.next_fire_time)
            .bind(schedule.last_fire_time)
            .bind(&schedule.id)
            .bind(scheduler_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?;

            if let Some(schedule_id) = updated {
                events.push(Event::ScheduleUpdated {
                    meta: self.events.next_meta(),
                    schedule_id,
                    next_fire_time: schedule.next_fire_time,
                });
            }
        }

        tx.commit().await.map_err(sqlx_err)?;
        for event in events {
            self.events.publish(event);
            self.notify();
        }
        Ok(())
    }

    async fn get_next_schedule_run_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar("SELECT MIN(next_fire_time) FROM cadence_schedules")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_err)
    }

    async fn add_job(&self, job: Job) -> Result<(), StoreError> {
        let args_bytes = self.options.serializer.serialize(&job.args)?;
        let kwargs_bytes = self.options.serializer.serialize(&job.kwargs)?;
        let tags: Vec<String> = job.tags.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO cadence_jobs
                (id, task_id, schedule_id, args, kwargs, tags, scheduled_fire_time,
                 start_deadline, created_at, acquired_by, acquired_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id)
        .bind(&job.task_id)
        .bind(&job.schedule_id)
        .bind(&args_bytes)
        .bind(&kwargs_bytes)
        .bind(&tags)
        .bind(job.scheduled_fire_time)
        .bind(job.start_deadline)
        .bind(job.created_at)
        .bind(&job.acquired_by)
        .bind(job.acquired_until)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;

        self.publish(|meta| Event::JobAdded {
            meta,
            job_id: job.id,
            task_id: job.task_id,
            schedule_id: job.schedule_id,
            tags: job.tags,
        });
        Ok(())
    }

    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> Result<Vec<Job>, StoreError> {
        let rows = match ids {
            Some(ids) => sqlx::query("SELECT * FROM cadence_jobs WHERE id = ANY($1) ORDER BY created_at, id")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(sqlx_err)?,
            None => sqlx::query("SELECT * FROM cadence_jobs ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await
                .map_err(sqlx_err)?,
        };
        Ok(rows.iter().filter_map(|row| self.decode_job_row_or_log(row)).collect())
    }

    async fn acquire_jobs(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let acquired_until = Utc::now() + self.options.lock_expiration_delay;

        // Postgres rejects `FOR UPDATE` combined with a window function in
        // the same SELECT, so the row lock and the per-task ranking live in
        // separate CTEs: `locked` claims and locks the leaseable rows first,
        // `ranked` then computes `ROW_NUMBER()` over that already-locked set,
        // and only rows whose rank leaves room under the task's remaining
        // `max_running_jobs` capacity make it into `claimable`. The claim and
        // the `running_jobs` increment below share one transaction so a
        // second acquirer can never observe the claim without the counter
        // that makes it count against admission.
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        let rows = sqlx::query(
            r#"
            WITH locked AS (
                SELECT j.id, j.task_id
                FROM cadence_jobs j
                WHERE j.acquired_until IS NULL OR j.acquired_until < NOW()
                ORDER BY j.created_at, j.id
                FOR UPDATE OF j SKIP LOCKED
            ),
            ranked AS (
                SELECT locked.id, t.max_running_jobs, t.running_jobs,
                       ROW_NUMBER() OVER (PARTITION BY locked.task_id ORDER BY locked.id) AS rnk
                FROM locked
                JOIN cadence_tasks t ON t.id = locked.task_id
            ),
            claimable AS (
                SELECT id FROM ranked
                WHERE max_running_jobs IS NULL OR rnk <= (max_running_jobs - running_jobs)
                LIMIT $1
            )
            UPDATE cadence_jobs
            SET acquired_by = $2,
                acquired_until = $3
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(limit as i64)
        .bind(worker_id)
        .bind(acquired_until)
        .fetch_all(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        // Decode before committing admission: a row that fails to decode
        // was never really leaseable, so its `running_jobs` increment must
        // not survive and the row itself is deleted rather than leased to
        // nobody forever.
        let mut jobs = Vec::with_capacity(rows.len());
        let mut decode_failures: Vec<(Uuid, String, DeserializationError)> = Vec::new();
        for row in &rows {
            let id: Uuid = row.try_get("id").map_err(sqlx_err)?;
            let task_id: String = row.try_get("task_id").map_err(sqlx_err)?;
            match self.decode_job_row(row) {
                Ok(job) => jobs.push(job),
                Err(error) => decode_failures.push((id, task_id, error)),
            }
        }

        let mut increments: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for job in &jobs {
            *increments.entry(job.task_id.clone()).or_insert(0) += 1;
        }
        for (_, task_id, _) in &decode_failures {
            *increments.entry(task_id.clone()).or_insert(0) -= 1;
        }
        for (task_id, increment) in increments {
            if increment == 0 {
                continue;
            }
            sqlx::query("UPDATE cadence_tasks SET running_jobs = running_jobs + $1 WHERE id = $2")
                .bind(increment as i32)
                .bind(&task_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_err)?;
        }
        for (job_id, _, _) in &decode_failures {
            sqlx::query("DELETE FROM cadence_jobs WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_err)?;
        }

        tx.commit().await.map_err(sqlx_err)?;

        for (job_id, _, error) in decode_failures {
            tracing::error!(%job_id, %error, "failed to deserialize job row, dropping it");
            self.publish(|meta| Event::JobDeserializationFailed {
                meta,
                job_id,
                error: error.0.clone(),
            });
        }

        for job in &jobs {
            self.publish(|meta| Event::JobAcquired {
                meta,
                job_id: job.id,
                worker_id: worker_id.to_string(),
            });
        }

        Ok(jobs)
    }

    async fn release_job(
        &self,
        worker_id: &str,
        task_id: &str,
        result: JobResult,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        let return_value_bytes = match &result.return_value {
            Some(value) => Some(self.options.serializer.serialize(value)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO cadence_job_results (job_id, outcome, finished_at, return_value, exception)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(result.job_id)
        .bind(outcome_str(result.outcome))
        .bind(result.finished_at)
        .bind(&return_value_bytes)
        .bind(&result.exception)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        sqlx::query(
            "UPDATE cadence_tasks SET running_jobs = GREATEST(running_jobs - 1, 0) WHERE id = $1",
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        sqlx::query("DELETE FROM cadence_jobs WHERE id = $1")
            .bind(result.job_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;

        self.publish(|meta| Event::JobReleased {
            meta,
            job_id: result.job_id,
            worker_id: worker_id.to_string(),
            outcome: result.outcome,
        });
        Ok(())
    }

    async fn get_job_result(&self, job_id: Uuid) -> Result<Option<JobResult>, StoreError> {
        let row = sqlx::query("DELETE FROM cadence_job_results WHERE job_id = $1 RETURNING *")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let outcome_raw: String = row.try_get("outcome").map_err(sqlx_err)?;
        let return_value_bytes: Option<Vec<u8>> = row.try_get("return_value").map_err(sqlx_err)?;
        let return_value = match return_value_bytes {
            Some(bytes) => match self.options.serializer.deserialize(&bytes) {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::error!(%job_id, %error, "failed to deserialize job result, dropping it");
                    self.publish(|meta| Event::JobDeserializationFailed {
                        meta,
                        job_id,
                        error: error.0.clone(),
                    });
                    return Ok(None);
                }
            },
            None => None,
        };

        Ok(Some(JobResult {
            job_id: row.try_get("job_id").map_err(sqlx_err)?,
            outcome: outcome_from_str(&outcome_raw),
            finished_at: row.try_get("finished_at").map_err(sqlx_err)?,
            return_value,
            exception: row.try_get("exception").map_err(sqlx_err)?,
        }))
    }
}

#[cfg(test)]
mod tests;
