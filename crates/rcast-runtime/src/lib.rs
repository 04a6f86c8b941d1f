//! Runtime surface shared by listeners and workers: the in-process
//! configuration registry, the per-node worker message queues, and the
//! scheduler that signals shutdown.
//!
//! Listeners only ever call the `enqueue_*` methods on [`Registry`]; one
//! worker task per remote node consumes its queue. The registry is the
//! authority for "which sets do I replicate from which provider"; workers
//! re-read it whenever the generation counter moves.

pub mod queue;
pub mod registry;
pub mod sched;

pub use queue::{MessageQueue, WorkMsg};
pub use registry::{NodeHandle, Registry, SetRow, WorkerStatus};
pub use sched::{SchedStatus, Scheduler};
