//! gridhub-pool — the managed worker pool.
//!
//! The `PoolManager` is the single synchronized owner of pool membership and
//! per-worker load counters. Every read-modify-write on a worker's load
//! (reserve, release, drain-completion check) happens inside one critical
//! section, so a worker can never be overbooked past its capacity and a
//! drain is never double-counted.
//!
//! Provisioning new workers is abstracted behind the [`Provisioner`] trait;
//! the orchestration platform that actually creates and destroys worker
//! processes lives behind it.

pub mod error;
pub mod pool;
pub mod provision;

pub use error::{PoolError, PoolResult};
pub use pool::PoolManager;
pub use provision::{ProvisionRetry, Provisioner, ProvisionedWorker, StaticProvisioner};
