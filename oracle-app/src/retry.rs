use crate::config::LoopConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed call.
    pub attempts: u32,
    pub base_backoff: Duration,
    /// Failures this soon after a slot started are treated as transient.
    pub warmup_grace: Duration,
    /// Failures this soon after any successful call are treated as transient.
    pub success_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_secs(1),
            warmup_grace: Duration::from_secs(20),
            success_grace: Duration::from_secs(10),
        }
    }
}

impl From<&LoopConfig> for RetryPolicy {
    fn from(cfg: &LoopConfig) -> Self {
        Self {
            attempts: cfg.retry_attempts,
            base_backoff: Duration::from_millis(cfg.retry_base_backoff_ms),
            warmup_grace: Duration::from_millis(cfg.warmup_grace_ms),
            success_grace: Duration::from_millis(cfg.success_grace_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    Warmup,
    RecentSuccess,
}

/// What to do once every retry has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// Leave the slot unprocessed and try again on a later pass.
    Abandon(AbandonReason),
    /// Post a fixed apology and commit it so the queue moves on.
    Apologize,
}

impl RetryPolicy {
    /// Delay before retry `attempt` (zero-based): base, 2x base, 4x base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts).map(|attempt| self.backoff(attempt))
    }

    pub fn exhausted(
        &self,
        now: Instant,
        started: Instant,
        last_success: Option<Instant>,
    ) -> Exhausted {
        if now.saturating_duration_since(started) < self.warmup_grace {
            return Exhausted::Abandon(AbandonReason::Warmup);
        }
        if let Some(last) = last_success {
            if now.saturating_duration_since(last) < self.success_grace {
                return Exhausted::Abandon(AbandonReason::RecentSuccess);
            }
        }
        Exhausted::Apologize
    }
}
