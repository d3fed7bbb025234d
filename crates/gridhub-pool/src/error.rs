//! Pool error types.

use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No Ready worker with spare capacity exists. Transient; callers
    /// should retry after a short backoff.
    #[error("no healthy worker available")]
    NoHealthyWorker,

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("invalid pool bounds: min {min} must be >= 1 and <= max {max}")]
    InvalidBounds { min: u32, max: u32 },

    /// The provisioner could not realize the desired count. The pool keeps
    /// running degraded at its current size.
    #[error("provisioning failed after {attempts} attempts: {source}")]
    ProvisioningFailure {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] gridhub_state::StateError),
}

pub type PoolResult<T> = Result<T, PoolError>;
