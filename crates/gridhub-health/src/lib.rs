//! gridhub-health — readiness and liveness probing for pool workers.
//!
//! A newly admitted worker stays in `Starting` until its status endpoint
//! answers a probe; an unresponsive `Ready` worker is marked `Failed` after
//! a bounded number of consecutive probe failures, without waiting for any
//! confirmation beyond the probe timeout.

pub mod checker;
pub mod monitor;

pub use checker::{http_probe, ProbeConfig, ProbeResult, ProbeTracker, ProbeVerdict};
pub use monitor::ReadinessMonitor;
