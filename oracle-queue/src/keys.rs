//! Key layout of the replicated queue namespace.

pub const MESSAGE_SEQ: &str = "message_seq";
pub const PROCESS_SEQ: &str = "process_seq";
pub const SUMMARY: &str = "summary";

pub fn pending(seq: u64) -> String {
    format!("pending/{seq}")
}

pub fn done(seq: u64) -> String {
    format!("done/{seq}")
}

pub fn rate_day(user: &str, day: u64) -> String {
    format!("rate/day/{user}/{day}")
}

pub fn rate_window(user: &str) -> String {
    format!("rate/window/{user}")
}

/// Trusted time observed when the log entry at `position` was replayed.
pub fn time(position: u64) -> String {
    format!("time/{position}")
}

/// Nicknames are owned by the chat application, the oracle only reads them.
pub fn nickname(user: &str) -> String {
    format!("nick/{user}")
}
