//! The per-origin remote worker.
//!
//! For every remote node this process replicates from, exactly one
//! [`RemoteWorker`] task consumes that node's message queue. Configuration
//! events are replayed into the registry and the local database in one
//! transaction each. SYNC events fan out to one helper task per data
//! provider; helpers stream re-materialized row changes back through a
//! bounded line pool, and the worker applies everything inside a single
//! local transaction that either commits with the advanced sync cursors or
//! rolls back and retries.

pub mod confirm;
pub mod copy_set;
pub mod helper;
pub mod lines;
pub mod provider;
pub mod reconcile;
pub mod sync;
pub mod worker;

pub use confirm::ConfirmCache;
pub use lines::{Line, LineCode, WorkData, WorkGroupStatus};
pub use provider::{HelperHandle, HelperStatus, ProviderContext, ProviderSet};
pub use worker::{RemoteWorker, WorkerConfig};
