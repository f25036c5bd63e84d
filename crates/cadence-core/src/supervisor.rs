//! Explicit scoped lifecycle composing store, scheduler, and worker (spec
//! §4.5, DESIGN NOTES §9: "global state -> scoped supervision").

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::registry::TaskRegistry;
use crate::scheduler::Scheduler;
use crate::store::DataStore;
use crate::worker::Worker;

/// Owns, in acquisition order, the worker and the scheduler, both sharing one
/// `DataStore` handle. Tears down in reverse order on [`Supervisor::shutdown`],
/// waiting up to a deadline for in-flight job dispatch to drain.
pub struct Supervisor {
    store: Arc<dyn DataStore>,
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    scheduler_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), StoreError>>>>,
    worker_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), StoreError>>>>,
}

impl Supervisor {
    pub fn new(identity: impl Into<String>, store: Arc<dyn DataStore>, registry: TaskRegistry) -> Arc<Self> {
        let identity = identity.into();
        let scheduler = Scheduler::new(format!("{identity}-scheduler"), Arc::clone(&store));
        let worker = Worker::new(format!("{identity}-worker"), Arc::clone(&store), registry);

        Arc::new(Self {
            store,
            scheduler,
            worker,
            scheduler_handle: tokio::sync::Mutex::new(None),
            worker_handle: tokio::sync::Mutex::new(None),
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Spawn the worker then the scheduler as background tasks.
    pub async fn start(self: &Arc<Self>) {
        let worker = Arc::clone(&self.worker);
        *self.worker_handle.lock().await = Some(tokio::spawn(worker.run()));

        let scheduler = Arc::clone(&self.scheduler);
        *self.scheduler_handle.lock().await = Some(tokio::spawn(scheduler.run()));
    }

    /// Stop the scheduler then the worker (reverse acquisition order),
    /// waiting up to `deadline` for each to finish. Leases still held when
    /// the deadline elapses are left for another participant to reclaim.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), StoreError> {
        self.scheduler.stop();
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            let _ = tokio::time::timeout(deadline, handle).await;
        }

        self.worker.stop();
        if let Some(handle) = self.worker_handle.lock().await.take() {
            let _ = tokio::time::timeout(deadline, handle).await;
        }

        Ok(())
    }
}
