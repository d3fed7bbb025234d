//! PoolManager — synchronized owner of worker membership and load counters.
//!
//! Selection-and-reserve, release, drain, and failure marking all run inside
//! a single mutex-guarded critical section. The lock is never held across an
//! await point, so routing stays responsive while the autoscaler and health
//! monitor mutate membership concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use gridhub_state::{
    NodeLoad, PoolConfig, StateStore, UtilizationSample, WorkerHealth, WorkerId, WorkerNode,
};

use crate::error::{PoolError, PoolResult};

struct PoolInner {
    /// Live membership: admitted workers that have not been removed yet.
    members: HashMap<WorkerId, WorkerNode>,
    /// Desired replica count, always within [min_count, max_count].
    desired: u32,
    /// Workers removed from membership but not yet deprovisioned.
    retired: Vec<WorkerNode>,
}

/// The managed worker pool.
///
/// Owns all pool membership and per-worker load counters. Cheap to share
/// behind an `Arc`; every method takes `&self`.
pub struct PoolManager {
    config: PoolConfig,
    state: StateStore,
    inner: Mutex<PoolInner>,
    next_worker: AtomicU64,
}

impl PoolManager {
    /// Create a pool manager with validated bounds.
    ///
    /// Stale worker records from a previous run are cleared; membership is
    /// rebuilt as workers are admitted.
    pub fn new(config: PoolConfig, state: StateStore) -> PoolResult<Self> {
        if config.min_count < 1 || config.min_count > config.max_count {
            return Err(PoolError::InvalidBounds {
                min: config.min_count,
                max: config.max_count,
            });
        }

        for stale in state.list_workers()? {
            state.delete_worker(&stale.id)?;
        }

        let desired = config.min_count;
        Ok(Self {
            config,
            state,
            inner: Mutex::new(PoolInner {
                members: HashMap::new(),
                desired,
                retired: Vec::new(),
            }),
            next_worker: AtomicU64::new(1),
        })
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn locked(&self) -> MutexGuard<'_, PoolInner> {
        // A panic while holding the lock leaves membership consistent enough
        // to keep serving; recover the guard rather than propagating poison.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Admit a freshly provisioned worker. It enters `Starting` and stays
    /// unroutable until a readiness probe promotes it.
    pub fn admit(&self, address: &str) -> PoolResult<WorkerNode> {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let now = epoch_secs();
        let worker = WorkerNode {
            id: format!("worker-{n}"),
            address: address.to_string(),
            capacity: self.config.worker_capacity,
            current_load: 0,
            health: WorkerHealth::Starting,
            started_at: now,
            ready_at: None,
            updated_at: now,
        };

        self.state.put_worker(&worker)?;
        let mut inner = self.locked();
        inner.members.insert(worker.id.clone(), worker.clone());
        info!(worker_id = %worker.id, address = %worker.address, "worker admitted");
        Ok(worker)
    }

    /// Promote a `Starting` worker to `Ready`.
    pub fn mark_ready(&self, worker_id: &str) -> PoolResult<()> {
        let updated = {
            let mut inner = self.locked();
            let worker = inner
                .members
                .get_mut(worker_id)
                .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
            if worker.health != WorkerHealth::Starting {
                debug!(%worker_id, health = ?worker.health, "mark_ready ignored");
                return Ok(());
            }
            let now = epoch_secs();
            worker.health = WorkerHealth::Ready;
            worker.ready_at = Some(now);
            worker.updated_at = now;
            worker.clone()
        };

        self.state.put_worker(&updated)?;
        info!(%worker_id, "worker ready");
        Ok(())
    }

    /// Mark a worker `Failed` and remove it from routing eligibility.
    ///
    /// If the worker has no in-flight sessions it is removed immediately;
    /// otherwise removal happens when its last session releases. Idempotent:
    /// unknown or already-failed workers are a no-op.
    pub fn mark_failed(&self, worker_id: &str) -> PoolResult<()> {
        let (removed, updated) = {
            let mut inner = self.locked();
            let Some(worker) = inner.members.get_mut(worker_id) else {
                debug!(%worker_id, "mark_failed on unknown worker ignored");
                return Ok(());
            };
            if worker.health == WorkerHealth::Failed {
                return Ok(());
            }
            worker.health = WorkerHealth::Failed;
            worker.updated_at = epoch_secs();
            if worker.current_load == 0 {
                if let Some(node) = inner.members.remove(worker_id) {
                    inner.retired.push(node);
                }
                (true, None)
            } else {
                (false, Some(worker.clone()))
            }
        };

        if removed {
            self.state.delete_worker(worker_id)?;
            warn!(%worker_id, "worker failed and removed");
        } else if let Some(worker) = updated {
            self.state.put_worker(&worker)?;
            warn!(
                %worker_id,
                in_flight = worker.current_load,
                "worker failed, removal deferred until sessions release"
            );
        }
        Ok(())
    }

    // ── Routing reservations ───────────────────────────────────────

    /// Select a `Ready` worker with spare capacity and reserve one slot on
    /// it, as a single critical section.
    ///
    /// Selection is least-loaded first, tie-broken by earliest readiness,
    /// then by id for determinism. Workers in `excluded` are avoided when
    /// any other candidate exists (used to rebind a retried session away
    /// from the worker that just failed it).
    pub fn reserve(&self, excluded: &[WorkerId]) -> PoolResult<WorkerNode> {
        let reserved = {
            let mut inner = self.locked();

            let pick = |skip_excluded: bool, members: &HashMap<WorkerId, WorkerNode>| {
                members
                    .values()
                    .filter(|w| w.is_routable())
                    .filter(|w| !skip_excluded || !excluded.contains(&w.id))
                    .min_by_key(|w| {
                        (w.current_load, w.ready_at.unwrap_or(u64::MAX), w.id.clone())
                    })
                    .map(|w| w.id.clone())
            };

            let chosen = pick(true, &inner.members).or_else(|| pick(false, &inner.members));
            let Some(id) = chosen else {
                return Err(PoolError::NoHealthyWorker);
            };

            // Selected under the same lock, so the slot is still free.
            let worker = inner
                .members
                .get_mut(&id)
                .ok_or_else(|| PoolError::UnknownWorker(id.clone()))?;
            worker.current_load += 1;
            worker.updated_at = epoch_secs();
            worker.clone()
        };

        self.state.put_worker(&reserved)?;
        debug!(worker_id = %reserved.id, load = reserved.current_load, "slot reserved");
        Ok(reserved)
    }

    /// Release one reserved slot on a worker.
    ///
    /// If the worker is `Draining` or `Failed` and this was its last
    /// in-flight session, it is removed from membership. Unknown workers
    /// (already removed) are a quiet no-op.
    pub fn release(&self, worker_id: &str) -> PoolResult<()> {
        let (removed, updated) = {
            let mut inner = self.locked();
            let Some(worker) = inner.members.get_mut(worker_id) else {
                debug!(%worker_id, "release on unknown worker ignored");
                return Ok(());
            };
            worker.current_load = worker.current_load.saturating_sub(1);
            worker.updated_at = epoch_secs();

            let gone = worker.current_load == 0
                && matches!(worker.health, WorkerHealth::Draining | WorkerHealth::Failed);
            if gone {
                if let Some(node) = inner.members.remove(worker_id) {
                    inner.retired.push(node);
                }
                (true, None)
            } else {
                (false, Some(worker.clone()))
            }
        };

        if removed {
            self.state.delete_worker(worker_id)?;
            info!(%worker_id, "drained worker removed");
        } else if let Some(worker) = updated {
            self.state.put_worker(&worker)?;
            debug!(%worker_id, load = worker.current_load, "slot released");
        }
        Ok(())
    }

    // ── Scaling ────────────────────────────────────────────────────

    /// Set the desired replica count, clamped to [min_count, max_count].
    /// Returns the clamped value.
    pub fn set_desired(&self, target: u32) -> u32 {
        let clamped = target.clamp(self.config.min_count, self.config.max_count);
        let mut inner = self.locked();
        inner.desired = clamped;
        clamped
    }

    pub fn desired_count(&self) -> u32 {
        self.locked().desired
    }

    /// Transition up to `count` workers to `Draining`, lowest load first,
    /// newest started first (long-lived warm workers are kept). Workers with
    /// no in-flight sessions are removed immediately; the rest are removed
    /// when their last session releases.
    ///
    /// Returns the ids of the selected victims.
    pub fn begin_drain(&self, count: u32) -> PoolResult<Vec<WorkerId>> {
        let (victims, to_delete, to_update) = {
            let mut inner = self.locked();

            let mut candidates: Vec<(u32, u64, WorkerId)> = inner
                .members
                .values()
                .filter(|w| {
                    matches!(w.health, WorkerHealth::Ready | WorkerHealth::Starting)
                })
                .map(|w| (w.current_load, u64::MAX - w.started_at, w.id.clone()))
                .collect();
            // Lowest load first, then newest started (started_at inverted).
            candidates.sort();
            let victims: Vec<WorkerId> = candidates
                .into_iter()
                .take(count as usize)
                .map(|(_, _, id)| id)
                .collect();

            let mut to_delete = Vec::new();
            let mut to_update = Vec::new();
            for id in &victims {
                let Some(worker) = inner.members.get_mut(id) else {
                    continue;
                };
                worker.health = WorkerHealth::Draining;
                worker.updated_at = epoch_secs();
                if worker.current_load == 0 {
                    if let Some(node) = inner.members.remove(id) {
                        inner.retired.push(node);
                    }
                    to_delete.push(id.clone());
                } else {
                    to_update.push(worker.clone());
                }
            }
            (victims, to_delete, to_update)
        };

        for id in &to_delete {
            self.state.delete_worker(id)?;
            info!(worker_id = %id, "idle worker drained and removed");
        }
        for worker in &to_update {
            self.state.put_worker(worker)?;
            info!(
                worker_id = %worker.id,
                in_flight = worker.current_load,
                "worker draining"
            );
        }
        Ok(victims)
    }

    /// Drain the list of removed workers awaiting deprovisioning.
    pub fn take_retired(&self) -> Vec<WorkerNode> {
        std::mem::take(&mut self.locked().retired)
    }

    // ── Observation ────────────────────────────────────────────────

    /// Number of members (any health state) still in the pool.
    pub fn member_count(&self) -> u32 {
        self.locked().members.len() as u32
    }

    /// Number of `Ready` members.
    pub fn ready_count(&self) -> u32 {
        self.locked()
            .members
            .values()
            .filter(|w| w.health == WorkerHealth::Ready)
            .count() as u32
    }

    /// Look up a member by id.
    pub fn get(&self, worker_id: &str) -> Option<WorkerNode> {
        self.locked().members.get(worker_id).cloned()
    }

    /// Current membership, sorted by id.
    pub fn snapshot(&self) -> Vec<WorkerNode> {
        let mut members: Vec<WorkerNode> = self.locked().members.values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// Utilization across `Ready` members at this instant.
    pub fn sample(&self) -> UtilizationSample {
        let inner = self.locked();
        let per_node: Vec<NodeLoad> = inner
            .members
            .values()
            .filter(|w| w.health == WorkerHealth::Ready)
            .map(|w| NodeLoad {
                worker_id: w.id.clone(),
                load_fraction: w.load_fraction(),
            })
            .collect();
        let aggregate = if per_node.is_empty() {
            0.0
        } else {
            per_node.iter().map(|n| n.load_fraction).sum::<f64>() / per_node.len() as f64
        };
        UtilizationSample {
            epoch: epoch_secs(),
            ready_count: per_node.len() as u32,
            per_node,
            aggregate,
        }
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
