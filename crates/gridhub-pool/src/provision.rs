//! Worker provisioning — the seam to the orchestration platform.
//!
//! The platform that actually creates and destroys worker processes sits
//! behind the [`Provisioner`] trait. [`ProvisionRetry`] wraps provisioning
//! calls with bounded exponential backoff: a transient platform failure is
//! retried, a persistent one surfaces as `ProvisioningFailure` and leaves
//! the pool running degraded at its current size.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{PoolError, PoolResult};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A worker process created by the platform, not yet admitted to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWorker {
    /// Address of the worker's command endpoint (`host:port`).
    pub address: String,
}

/// Interface to the orchestration platform.
pub trait Provisioner: Send + Sync {
    /// Create one worker process; resolves once it has a routable address.
    fn provision(&self) -> BoxFuture<anyhow::Result<ProvisionedWorker>>;

    /// Destroy the worker process behind `address`.
    fn deprovision(&self, address: &str) -> BoxFuture<anyhow::Result<()>>;
}

/// Bounded-backoff retry policy for provisioning calls.
#[derive(Debug, Clone)]
pub struct ProvisionRetry {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for ProvisionRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl ProvisionRetry {
    /// Call `provision` up to `max_attempts` times, doubling the backoff
    /// between attempts.
    pub async fn provision(
        &self,
        provisioner: &dyn Provisioner,
    ) -> PoolResult<ProvisionedWorker> {
        let mut backoff = self.base_backoff;
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match provisioner.provision().await {
                Ok(worker) => {
                    debug!(address = %worker.address, attempt, "worker provisioned");
                    return Ok(worker);
                }
                Err(e) => {
                    warn!(attempt, max = self.max_attempts, error = %e, "provision attempt failed");
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(PoolError::ProvisioningFailure {
            attempts: self.max_attempts,
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")),
        })
    }
}

/// Provisioner over a fixed fleet of pre-created worker addresses.
///
/// Hands out the next unused address on `provision` and returns addresses
/// to the free list on `deprovision`. Fails once the fleet is exhausted.
pub struct StaticProvisioner {
    free: Mutex<VecDeque<String>>,
}

impl StaticProvisioner {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            free: Mutex::new(addresses.into()),
        }
    }

    /// Number of addresses still available.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Provisioner for StaticProvisioner {
    fn provision(&self) -> BoxFuture<anyhow::Result<ProvisionedWorker>> {
        let next = self
            .free
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        Box::pin(async move {
            match next {
                Some(address) => Ok(ProvisionedWorker { address }),
                None => Err(anyhow::anyhow!("worker fleet exhausted")),
            }
        })
    }

    fn deprovision(&self, address: &str) -> BoxFuture<anyhow::Result<()>> {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        if !free.contains(&address.to_string()) {
            free.push_back(address.to_string());
        }
        Box::pin(async { Ok(()) })
    }
}
