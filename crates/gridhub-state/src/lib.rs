//! gridhub-state — embedded state store for GridHub.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for worker nodes, dispatch sessions, and utilization
//! samples.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Keys are the record's natural identifier (worker id, session id, or a
//! zero-padded sample epoch so that samples iterate in time order).
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
