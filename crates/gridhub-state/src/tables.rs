//! redb table definitions for the GridHub state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types).

use redb::TableDefinition;

/// Worker node records keyed by `{worker_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Session records keyed by `{session_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Utilization samples keyed by zero-padded `{epoch}` so iteration is
/// chronological.
pub const UTILIZATION: TableDefinition<&str, &[u8]> = TableDefinition::new("utilization");
