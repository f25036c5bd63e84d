//! The error taxonomy: lookup, conflict, codec, and backend failures.
//!
//! Lookup and conflict errors are meaningful to callers and are matched on;
//! codec errors are caught internally by stores and turned into
//! `*DeserializationFailed` events instead of propagating.

use uuid::Uuid;

/// Caller asked for a task id that does not exist.
#[derive(Debug, thiserror::Error)]
#[error("unknown task id: {0}")]
pub struct TaskLookupError(pub String);

/// Caller asked for a job id that does not exist (or its result already consumed).
#[derive(Debug, thiserror::Error)]
#[error("unknown job id: {0}")]
pub struct JobLookupError(pub Uuid);

/// `add_schedule` with `ConflictPolicy::Exception` hit an existing id.
#[derive(Debug, thiserror::Error)]
#[error("schedule id already exists: {0}")]
pub struct ConflictingIdError(pub String);

/// A value could not be turned into its wire representation.
#[derive(Debug, thiserror::Error)]
#[error("serialization failed: {0}")]
pub struct SerializationError(pub String);

/// A value could not be reconstructed from its wire representation.
#[derive(Debug, thiserror::Error)]
#[error("deserialization failed: {0}")]
pub struct DeserializationError(pub String);

/// Errors surfaced by a `DataStore` operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    TaskLookup(#[from] TaskLookupError),
    #[error(transparent)]
    JobLookup(#[from] JobLookupError),
    #[error(transparent)]
    ConflictingId(#[from] ConflictingIdError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),
    /// Underlying driver failure (connection, transaction, schema). Transient
    /// ones are logged and retried by the scheduler/worker loops; startup and
    /// schema errors are expected to terminate the process.
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// A job's terminal outcome when it could not be run at all or raised.
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    #[error("task has no registered handler: {0}")]
    UnresolvedTask(String),
    #[error("job raised: {0}")]
    Raised(#[from] anyhow::Error),
}
