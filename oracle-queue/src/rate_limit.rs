//! Per-user admission limits: a UTC-day counter and a sliding window.

use crate::machine::RejectReason;
use serde::{Deserialize, Serialize};

pub const DAY_MS: u64 = 86_400_000;

pub fn day_key(now: u64) -> u64 {
    now / DAY_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub daily_cap: u64,
    pub window_ms: u64,
    pub window_max: usize,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            daily_cap: 1500,
            window_ms: 60_000,
            window_max: 10,
        }
    }
}

/// What the limiter saw when it admitted a message. Turned into the new
/// counter values only once the message is actually enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSnapshot {
    pub day: u64,
    pub daily_count: u64,
    /// Window timestamps that survived eviction, oldest first.
    pub window: Vec<u64>,
}

impl RateSnapshot {
    pub fn record(mut self, now: u64, window_max: usize) -> (u64, Vec<u64>) {
        self.window.push(now);
        let overflow = self.window.len().saturating_sub(window_max);
        self.window.drain(..overflow);
        (self.daily_count.saturating_add(1), self.window)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Admit(RateSnapshot),
    Reject(RejectReason),
}

impl RatePolicy {
    pub fn check(&self, daily_count: u64, window: &[u64], now: u64) -> RateDecision {
        if daily_count >= self.daily_cap {
            return RateDecision::Reject(RejectReason::DailyLimit);
        }

        let cutoff = now.saturating_sub(self.window_ms);
        let mut live: Vec<u64> = window.iter().copied().filter(|t| *t >= cutoff).collect();
        live.sort_unstable();
        if live.len() >= self.window_max {
            return RateDecision::Reject(RejectReason::WindowLimit);
        }

        RateDecision::Admit(RateSnapshot {
            day: day_key(now),
            daily_count,
            window: live,
        })
    }
}
