//! Domain types for the GridHub state store.
//!
//! These types represent the persisted state of the worker pool, dispatch
//! sessions, and utilization history. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a worker node in the pool.
pub type WorkerId = String;

/// Unique identifier for a dispatch session.
pub type SessionId = String;

// ── Worker ─────────────────────────────────────────────────────────

/// A single remote-execution worker in the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerNode {
    pub id: WorkerId,
    /// Address of the worker's command endpoint (`host:port`).
    pub address: String,
    /// Maximum concurrent sessions this worker accepts (typically 1).
    pub capacity: u32,
    /// Sessions currently bound to this worker.
    pub current_load: u32,
    pub health: WorkerHealth,
    /// Unix timestamp (seconds) when this worker was admitted to the pool.
    pub started_at: u64,
    /// Unix timestamp when the worker first passed a readiness probe.
    pub ready_at: Option<u64>,
    /// Unix timestamp of last state change.
    pub updated_at: u64,
}

impl WorkerNode {
    /// Whether the router may bind a new session to this worker.
    pub fn is_routable(&self) -> bool {
        self.health == WorkerHealth::Ready && self.current_load < self.capacity
    }

    /// Fraction of capacity currently in use (0.0–1.0).
    pub fn load_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.capacity)
    }
}

/// Lifecycle state of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Provisioned but not yet passed a readiness probe. Not routable.
    Starting,
    /// Accepting sessions.
    Ready,
    /// Finishing in-flight sessions; removed once load reaches zero.
    Draining,
    /// Unresponsive or faulted. Not routable, removed once load reaches zero.
    Failed,
}

// ── Session ────────────────────────────────────────────────────────

/// Persisted state of one dispatch session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    /// The worker this session is currently bound to, if any.
    pub worker_id: Option<WorkerId>,
    pub state: SessionState,
    /// Attempts consumed so far (0 on the first attempt).
    pub retry_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle state of a session. A session is bound to at most one worker
/// at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Bound,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

// ── Utilization ────────────────────────────────────────────────────

/// Load fraction of a single worker at sampling time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeLoad {
    pub worker_id: WorkerId,
    /// `current_load / capacity`, 0.0–1.0.
    pub load_fraction: f64,
}

/// Point-in-time utilization snapshot across the Ready members of the pool.
///
/// Input to the autoscaler; also persisted as history for inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtilizationSample {
    /// Unix timestamp (seconds) when the sample was taken.
    pub epoch: u64,
    pub per_node: Vec<NodeLoad>,
    /// Mean load fraction across Ready workers. 0.0 when no worker is Ready.
    pub aggregate: f64,
    /// Number of Ready workers at sampling time.
    pub ready_count: u32,
}

// ── Pool configuration ─────────────────────────────────────────────

/// Externally supplied pool and dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Lower bound on pool size. Must be ≥ 1.
    pub min_count: u32,
    /// Upper bound on pool size. Must be ≥ `min_count`.
    pub max_count: u32,
    /// Target mean load fraction the autoscaler steers toward (0.0–1.0).
    pub target_utilization: f64,
    /// Seconds between autoscaler evaluation ticks.
    pub evaluation_interval_secs: u64,
    /// Cooldown after a scale-up before another scale-up.
    pub scale_up_cooldown_secs: u64,
    /// Cooldown after a scale-down before another scale-down.
    pub scale_down_cooldown_secs: u64,
    /// Maximum attempts per session before it is terminally failed.
    pub max_retries: u32,
    /// Wall-clock bound on a single session attempt, in seconds.
    pub session_timeout_secs: u64,
    /// Timeout for a single readiness probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Sessions each worker accepts concurrently.
    pub worker_capacity: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        // Mirrors a one-to-five replica pool steered to 50% utilization.
        Self {
            min_count: 1,
            max_count: 5,
            target_utilization: 0.5,
            evaluation_interval_secs: 30,
            scale_up_cooldown_secs: 0,
            scale_down_cooldown_secs: 60,
            max_retries: 3,
            session_timeout_secs: 300,
            probe_timeout_ms: 2000,
            worker_capacity: 1,
        }
    }
}

impl PoolConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ── Table keys ─────────────────────────────────────────────────────

impl WorkerNode {
    /// Key for the workers table.
    pub fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl SessionRecord {
    /// Key for the sessions table.
    pub fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl UtilizationSample {
    /// Key for the utilization table. Zero-padded so lexicographic order
    /// matches chronological order.
    pub fn table_key(&self) -> String {
        format!("{:020}", self.epoch)
    }
}
