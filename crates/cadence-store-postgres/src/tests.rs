//! Unit tests for pure helpers plus a handful of real-database integration
//! tests gated on `DATABASE_URL`, following the same opt-in pattern as most
//! `sqlx`-based crates: `cargo test` alone runs only the former.

use cadence_core::model::{CoalescePolicy, JobOutcome};

use super::{coalesce_str, outcome_from_str, outcome_str};

#[test]
fn coalesce_policy_round_trips_through_its_string_form() {
    for policy in [CoalescePolicy::Earliest, CoalescePolicy::Latest, CoalescePolicy::All] {
        let s = coalesce_str(policy);
        let parsed = match s {
            "earliest" => CoalescePolicy::Earliest,
            "all" => CoalescePolicy::All,
            _ => CoalescePolicy::Latest,
        };
        assert_eq!(parsed, policy);
    }
}

#[test]
fn job_outcome_round_trips_through_its_string_form() {
    for outcome in [
        JobOutcome::Success,
        JobOutcome::Error,
        JobOutcome::MissedStartDeadline,
        JobOutcome::Cancelled,
    ] {
        assert_eq!(outcome_from_str(outcome_str(outcome)), outcome);
    }
}

/// Requires a running PostgreSQL reachable at `$DATABASE_URL` with the
/// schema from this crate's module docs already applied. Skips itself (by
/// panicking with a clear message caught nowhere) if the variable is unset,
/// matching how this suite is run in CI versus a plain local `cargo test`.
#[cfg(test)]
mod integration {
    use std::sync::Arc;

    use cadence_core::model::ConflictPolicy;
    use cadence_core::store::DataStore;
    use cadence_testing::{ad_hoc_job, overdue_schedule, task, unique_id};

    use crate::{PostgresDataStore, PostgresDataStoreOptions};

    async fn connect() -> Option<Arc<PostgresDataStore>> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(
            PostgresDataStore::new(
                sqlx::PgPool::connect(&url).await.expect("connect to test database"),
                PostgresDataStoreOptions::default(),
            )
            .await
            .expect("construct store"),
        )
    }

    #[tokio::test]
    async fn acquire_schedules_claims_a_due_schedule() {
        let Some(store) = connect().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };

        let task_id = unique_id("task");
        store.add_task(task(&task_id)).await.unwrap();
        let schedule_id = unique_id("schedule");
        store
            .add_schedule(
                overdue_schedule(&schedule_id, &task_id, chrono::Duration::seconds(5)),
                ConflictPolicy::Exception,
            )
            .await
            .unwrap();

        let acquired = store.acquire_schedules("scheduler-1", 10).await.unwrap();
        assert!(acquired.iter().any(|s| s.id == schedule_id));

        let other = store.acquire_schedules("scheduler-2", 10).await.unwrap();
        assert!(!other.iter().any(|s| s.id == schedule_id));
    }

    #[tokio::test]
    async fn release_job_records_result_and_frees_the_task_slot() {
        let Some(store) = connect().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };

        let task_id = unique_id("task");
        store.add_task(task(&task_id).with_max_running_jobs(1)).await.unwrap();
        store.add_job(ad_hoc_job(&task_id)).await.unwrap();

        let acquired = store.acquire_jobs("worker-1", 10).await.unwrap();
        assert_eq!(acquired.len(), 1);
        let job_id = acquired[0].id;

        let result = cadence_core::model::JobResult::success(job_id, serde_json::json!(null));
        store.release_job("worker-1", &task_id, result).await.unwrap();

        let fetched = store.get_job_result(job_id).await.unwrap();
        assert!(fetched.is_some());
        assert!(store.get_job_result(job_id).await.unwrap().is_none());
    }
}
