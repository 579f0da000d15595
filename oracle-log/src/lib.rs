//! Interface to the replicated log the queue lives in.
//!
//! The real substrate (consensus, signing, transport) is external. The oracle
//! only needs ordered appends and eventually consistent reads with local
//! read-your-writes, which is what `QueueLog` captures. `MemoryReplica` is a
//! single-process replica used by the CLI and by tests.

mod queue_log;
mod replica;

pub use queue_log::{QueueLog, Slot};
pub use replica::{LoggedOp, MemoryReplica, replay};
