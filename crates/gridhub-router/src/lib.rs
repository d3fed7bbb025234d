//! gridhub-router — the stable service endpoint in front of the pool.
//!
//! Maps an incoming session request to one healthy worker. Selection and
//! load reservation happen as a single critical section inside the pool, so
//! two sessions can never race onto a worker's last free slot. The returned
//! [`WorkerBinding`] releases the reservation exactly once, on explicit
//! release or on drop.

pub mod router;

pub use router::{RouteError, Router, WorkerBinding};
