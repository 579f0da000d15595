//! Deterministic queue state machine for the shared chat oracle.
//!
//! Everything in this crate is a pure function of replicated state, the log
//! entry being replayed and the trusted time handed in by the substrate. There
//! is no I/O, no clock and no randomness here: every replica replaying the same
//! log must end up with bit-identical state.

mod classify;
mod error;
pub mod keys;
mod machine;
mod rate_limit;
mod state;
mod types;

pub use classify::{Classification, classify, extract_tagged_prompt, random_participation};
pub use error::{QueueError, Result};
pub use machine::{Applied, IgnoreReason, Outcome, QueueConfig, QueueMachine, RejectReason};
pub use rate_limit::{DAY_MS, RateDecision, RatePolicy, RateSnapshot, day_key};
pub use state::{Batch, MemoryState, Mutation, StateView, read_counters, read_json, read_u64};
pub use types::{
    Attachment, ChatEvent, ControlOp, DoneEntry, LogOp, PendingEntry, QueueKind, ResultCommit,
    SequenceCounters, UserId,
};
