//! Readiness monitor — background probe loops for pool workers.
//!
//! One task per watched worker. A `Starting` worker is promoted to `Ready`
//! on its first successful probe; a worker whose probes cross the failure
//! threshold is marked `Failed` and dropped from routing eligibility.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridhub_pool::PoolManager;
use gridhub_state::{WorkerHealth, WorkerId};

use crate::checker::{http_probe, ProbeConfig, ProbeTracker, ProbeVerdict};

/// Per-worker monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages probe loops for all watched workers.
pub struct ReadinessMonitor {
    pool: Arc<PoolManager>,
    probe: ProbeConfig,
    /// Active monitors: worker_id → slot.
    monitors: Arc<RwLock<HashMap<WorkerId, MonitorSlot>>>,
}

impl ReadinessMonitor {
    pub fn new(pool: Arc<PoolManager>, probe: ProbeConfig) -> Self {
        Self {
            pool,
            probe,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start probing a worker. Replaces any existing monitor for the same
    /// worker id.
    pub async fn watch(&self, worker_id: &str, address: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = self.pool.clone();
        let config = self.probe.clone();
        let id = worker_id.to_string();
        let addr = address.to_string();

        let handle = tokio::spawn(async move {
            run_probe_loop(pool, &id, &addr, &config, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            worker_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%worker_id, %address, "readiness monitor started");
    }

    /// Stop probing a worker.
    pub async fn unwatch(&self, worker_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(worker_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%worker_id, "readiness monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(worker_id = %id, "readiness monitor stopped");
        }
        info!("all readiness monitors stopped");
    }

    /// Worker ids with active monitors.
    pub async fn watched(&self) -> Vec<WorkerId> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_watching(&self, worker_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(worker_id)
    }
}

/// The probe loop for a single worker.
async fn run_probe_loop(
    pool: Arc<PoolManager>,
    worker_id: &str,
    address: &str,
    config: &ProbeConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = ProbeTracker::new(config);
    debug!(%worker_id, %address, "probe loop starting");

    loop {
        let interval = tracker.next_interval();

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                // The worker may have been drained or failed elsewhere.
                let Some(worker) = pool.get(worker_id) else {
                    debug!(%worker_id, "worker left the pool, probe loop ending");
                    break;
                };
                if worker.health == WorkerHealth::Failed {
                    break;
                }

                let result = http_probe(address, &config.path, config.timeout).await;
                match tracker.record(result) {
                    ProbeVerdict::Reachable => {
                        if worker.health == WorkerHealth::Starting {
                            if let Err(e) = pool.mark_ready(worker_id) {
                                warn!(%worker_id, error = %e, "failed to promote worker");
                            }
                        }
                    }
                    ProbeVerdict::Pending => {}
                    ProbeVerdict::Lost => {
                        warn!(%worker_id, %address, "worker unresponsive, marking failed");
                        if let Err(e) = pool.mark_failed(worker_id) {
                            warn!(%worker_id, error = %e, "failed to mark worker failed");
                        }
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(%worker_id, "probe loop shutting down");
                break;
            }
        }
    }
}
