//! Data model for the rowcast replication engine.
//!
//! Everything in this crate is plain data plus the SQL-fragment algebra the
//! worker needs to qualify log rows: transaction-id snapshots, per-set sync
//! cursors, and the reconstruction of apply statements from captured log
//! rows. No I/O happens here.

pub mod event;
pub mod log;
pub mod qual;
pub mod snapshot;

pub use event::{Confirm, Event, EventType};
pub use log::{LogRow, RowChange};
pub use qual::{provider_qualification, SetSyncCursor, SyncSet};
pub use snapshot::XidSnapshot;

/// Replication node identifier (`no_id` on the wire).
pub type NodeId = i32;

/// Replication set identifier.
pub type SetId = i32;

/// Identifier of a table within a set (`tab_id`).
pub type TableId = i32;

/// Per-origin event sequence number. Strictly increasing per origin.
pub type EventSeq = i64;
