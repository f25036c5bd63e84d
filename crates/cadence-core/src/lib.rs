//! # Cadence
//!
//! The core of a distributed, persistent job scheduler: the coordination
//! protocol by which one or more [`Scheduler`] processes translate recurring
//! [`Schedule`]s into discrete [`Job`]s, and one or more [`Worker`] processes
//! claim and execute those jobs, all mediated by a shared [`DataStore`] that
//! provides lease-based concurrency control.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler.run()                         Worker.run()
//!     │                                        │
//!     ▼ acquire_schedules()                     ▼ acquire_jobs()
//! DataStore ◄─────────────────────────────────► DataStore
//!     │                                        │
//!     ▼ add_job() per fire time                ▼ release_job(JobResult)
//! DataStore.events() ──────────── EventBroker ──┘
//!     │
//!     ▼ JobReleased
//! get_job_result() wakes
//! ```
//!
//! ## Key invariants
//!
//! 1. The data store is the single source of truth; scheduler and worker
//!    hold only transient in-memory copies during one tick.
//! 2. Acquisition is lease-based: `acquired_by`/`acquired_until` pairs expire
//!    on wall-clock time, so a crashed scheduler or worker cannot block
//!    progress forever.
//! 3. Firing is at-least-once, never exactly-once: a scheduler that crashes
//!    between producing jobs and releasing its lease may re-fire on retry.
//! 4. A `JobResult` is consumed on read: the first caller of
//!    `get_job_result` to observe it deletes the row.
//!
//! ## What this is not
//!
//! Cadence does **not** implement priority queues among schedules (FIFO by
//! next fire time), in-flight job cancellation (only unstarted jobs via
//! `start_deadline`), or cross-cluster clock synchronization beyond sharing
//! a wall clock within the lease-expiration delay.

pub mod error;
pub mod events;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod serializer;
pub mod store;
pub mod supervisor;
pub mod trigger;
pub mod worker;

pub use error::{
    ConflictingIdError, DeserializationError, JobExecutionError, JobLookupError,
    SerializationError, StoreError, TaskLookupError,
};
pub use events::{Event, EventBroker, EventKind, EventMeta, Subscription};
pub use model::{CoalescePolicy, ConflictPolicy, Job, JobOutcome, JobResult, RunState, Schedule, Task};
pub use registry::{JobArgs, TaskRegistry};
pub use scheduler::{AddJobOptions, AddScheduleOptions, JobRunError, Scheduler};
pub use serializer::{JsonSerializer, Serializer};
pub use store::DataStore;
pub use supervisor::Supervisor;
pub use trigger::{IntervalTrigger, OnceTrigger, Trigger};
pub use worker::Worker;

#[cfg(test)]
mod scheduler_tests;
#[cfg(test)]
mod worker_tests;
