//! Least-loaded router over the worker pool.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use gridhub_pool::{PoolError, PoolManager};
use gridhub_state::WorkerId;

/// Errors returned when routing a session request.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No Ready worker with spare capacity. Transient; retry after backoff.
    #[error("no healthy worker available")]
    NoHealthyWorker,

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

/// The stable endpoint that balances session requests across the pool.
#[derive(Clone)]
pub struct Router {
    pool: Arc<PoolManager>,
}

impl Router {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self { pool }
    }

    /// Route a session request to a worker, reserving one slot on it.
    ///
    /// Never selects a worker in `Starting`, `Draining`, or `Failed` state,
    /// nor one already at capacity.
    pub fn route(&self) -> Result<WorkerBinding, RouteError> {
        self.route_excluding(&[])
    }

    /// Route while avoiding the given workers when any alternative exists.
    /// Used by retrying sessions to rebind away from a worker that just
    /// failed them.
    pub fn route_excluding(&self, excluded: &[WorkerId]) -> Result<WorkerBinding, RouteError> {
        match self.pool.reserve(excluded) {
            Ok(worker) => {
                debug!(worker_id = %worker.id, "session routed");
                Ok(WorkerBinding {
                    pool: self.pool.clone(),
                    worker_id: worker.id,
                    address: worker.address,
                    released: false,
                })
            }
            Err(PoolError::NoHealthyWorker) => Err(RouteError::NoHealthyWorker),
            Err(e) => Err(RouteError::Pool(e)),
        }
    }

    /// Route with bounded retries over transient `NoHealthyWorker`, doubling
    /// the backoff between attempts.
    pub async fn route_with_retry(
        &self,
        excluded: &[WorkerId],
        attempts: u32,
        base_backoff: Duration,
    ) -> Result<WorkerBinding, RouteError> {
        let mut backoff = base_backoff;
        for attempt in 1..=attempts {
            match self.route_excluding(excluded) {
                Ok(binding) => return Ok(binding),
                Err(RouteError::NoHealthyWorker) if attempt < attempts => {
                    debug!(attempt, "no healthy worker, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RouteError::NoHealthyWorker)
    }
}

/// A reserved slot on one worker, held for the duration of a session
/// attempt.
///
/// The reservation is released exactly once: explicitly via
/// [`WorkerBinding::release`], or on drop as a safety net.
pub struct WorkerBinding {
    pool: Arc<PoolManager>,
    worker_id: WorkerId,
    address: String,
    released: bool,
}

impl WorkerBinding {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Address of the bound worker's command endpoint.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Release the reserved slot.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.pool.release(&self.worker_id) {
            warn!(worker_id = %self.worker_id, error = %e, "failed to release reservation");
        }
    }
}

impl Drop for WorkerBinding {
    fn drop(&mut self) {
        self.release_once();
    }
}
