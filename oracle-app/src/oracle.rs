use crate::config::OracleConfig;
use crate::context::{ContextComposer, ContextLimits, HistoryPair};
use crate::inflight::{Claim, InflightTable};
use crate::retry::{AbandonReason, Exhausted, RetryPolicy};
use crate::sanitize::ReplySanitizer;
use crate::summary;
use oracle_llm::{ChatMessage, Complete, HeuristicCounter};
use oracle_log::{QueueLog, Slot};
use oracle_queue::{ChatEvent, ControlOp, LogOp, PendingEntry, QueueKind, ResultCommit, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const APOLOGY: &str = "Sorry, I couldn't come up with an answer just now. Please ask again later.";

const COMMIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const INFLIGHT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub admin: UserId,
    pub poll_interval: Duration,
    pub max_backlog: u64,
    pub history_window: usize,
    pub summary_max_bytes: usize,
    pub commit_wait: Duration,
}

impl From<&OracleConfig> for LoopSettings {
    fn from(cfg: &OracleConfig) -> Self {
        Self {
            admin: cfg.admin(),
            poll_interval: Duration::from_millis(cfg.oracle.poll_interval_ms),
            max_backlog: cfg.oracle.max_backlog,
            history_window: cfg.context.history_window,
            summary_max_bytes: cfg.context.summary_max_bytes,
            commit_wait: Duration::from_millis(cfg.oracle.commit_wait_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Malformed,
    SelfAuthored,
    StuckInflight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Post,
    Commit,
    Control,
}

/// What one pass of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    /// The counters say there is work but the pending entry has not arrived.
    Lagging { seq: u64 },
    Busy { seq: u64 },
    Replied {
        seq: u64,
        apologized: bool,
        /// Our commit advanced the local processed pointer within the wait.
        committed_visible: bool,
    },
    Abandoned { seq: u64, reason: AbandonReason },
    Skipped { seq: u64, reason: SkipReason },
    Clamped { to: u64 },
    Failed { seq: Option<u64>, stage: Stage },
}

/// Consumes the queue on the administrator's node: one slot per tick.
pub struct OracleLoop<L, C> {
    log: Arc<L>,
    llm: Arc<C>,
    composer: ContextComposer,
    sanitizer: ReplySanitizer,
    retry: RetryPolicy,
    inflight: InflightTable,
    settings: LoopSettings,
    last_success: Option<Instant>,
    /// Slot currently being worked on and when work on it first began.
    started: Option<(u64, Instant)>,
}

impl<L: QueueLog, C: Complete> OracleLoop<L, C> {
    pub fn new(
        log: Arc<L>,
        llm: Arc<C>,
        composer: ContextComposer,
        sanitizer: ReplySanitizer,
        retry: RetryPolicy,
        inflight: InflightTable,
        settings: LoopSettings,
    ) -> Self {
        Self {
            log,
            llm,
            composer,
            sanitizer,
            retry,
            inflight,
            settings,
            last_success: None,
            started: None,
        }
    }

    pub fn from_config(cfg: &OracleConfig, log: Arc<L>, llm: Arc<C>) -> anyhow::Result<Self> {
        let composer = ContextComposer::new(
            cfg.general.persona.clone(),
            ContextLimits::from(&cfg.context),
            Arc::new(HeuristicCounter),
        );
        let sanitizer = ReplySanitizer::new(
            &cfg.general.trigger,
            &cfg.general.placeholder,
            cfg.queue_config().mention_marker,
            cfg.transport.max_message_bytes,
        )?;
        let inflight = InflightTable::new(
            Duration::from_millis(cfg.oracle.inflight_ttl_ms),
            cfg.oracle.inflight_max_retries,
            INFLIGHT_CAPACITY,
        );
        Ok(Self::new(
            log,
            llm,
            composer,
            sanitizer,
            RetryPolicy::from(&cfg.oracle),
            inflight,
            LoopSettings::from(cfg),
        ))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(admin = %self.settings.admin, "oracle loop started");
        while !shutdown.is_cancelled() {
            let outcome = self.tick().await;
            let pause = match outcome {
                TickOutcome::Replied { .. }
                | TickOutcome::Skipped { .. }
                | TickOutcome::Clamped { .. } => Duration::ZERO,
                _ => self.settings.poll_interval,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        tracing::info!("oracle loop stopped");
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let counters = match self.log.counters().await {
            Ok(counters) => counters,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read queue counters");
                return TickOutcome::Failed {
                    seq: None,
                    stage: Stage::Read,
                };
            }
        };
        self.inflight.prune_through(counters.process_seq);

        if counters.backlog() > self.settings.max_backlog {
            let target = counters.message_seq - self.settings.max_backlog;
            tracing::warn!(
                backlog = counters.backlog(),
                max_backlog = self.settings.max_backlog,
                target,
                "backlog over cap; skipping oldest prompts"
            );
            return match self.fast_forward(QueueKind::Tagged, target).await {
                Ok(()) => TickOutcome::Clamped { to: target },
                Err(stage) => TickOutcome::Failed {
                    seq: Some(target),
                    stage,
                },
            };
        }

        let Some(seq) = counters.next_unprocessed() else {
            return TickOutcome::Idle;
        };

        let pending = match self.log.pending(seq).await {
            Ok(Slot::Present(pending)) => pending,
            Ok(Slot::Missing) => {
                tracing::debug!(seq, "pending entry not replicated yet");
                return TickOutcome::Lagging { seq };
            }
            Ok(Slot::Malformed(error)) => {
                tracing::warn!(seq, error = %error, "pending entry malformed; skipping");
                return self.skip(seq, QueueKind::Tagged, SkipReason::Malformed).await;
            }
            Err(e) => {
                tracing::warn!(seq, error = %e, "failed to read pending entry");
                return TickOutcome::Failed {
                    seq: Some(seq),
                    stage: Stage::Read,
                };
            }
        };

        if pending.from == self.settings.admin {
            tracing::warn!(seq, "pending entry authored by the oracle; skipping");
            return self.skip(seq, pending.kind, SkipReason::SelfAuthored).await;
        }

        match self.inflight.claim(seq, Instant::now()) {
            Claim::Claimed => {}
            Claim::Busy => return TickOutcome::Busy { seq },
            Claim::Reclaimed { retries } => {
                tracing::warn!(seq, retries, "inflight marker expired; retrying slot");
            }
            Claim::Exhausted => {
                tracing::warn!(seq, "slot stuck inflight; skipping");
                return self.skip(seq, pending.kind, SkipReason::StuckInflight).await;
            }
        }

        self.process(seq, pending).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(seq = seq, from = %pending.from, queue = pending.kind.as_str()))]
    async fn process(&mut self, seq: u64, pending: PendingEntry) -> TickOutcome {
        let started = match self.started {
            Some((current, at)) if current == seq => at,
            _ => {
                let now = Instant::now();
                self.started = Some((seq, now));
                now
            }
        };

        let previous_summary = match self.log.summary().await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read summary; composing without it");
                None
            }
        };
        let history = self.history_before(seq).await;
        let context = self
            .composer
            .compose(previous_summary.as_deref(), history, &pending.prompt);
        tracing::debug!(
            tokens = context.tokens,
            request_bytes = context.request_bytes,
            dropped_pairs = context.dropped_pairs,
            fits = context.fits,
            inflight = self.inflight.len(),
            "context composed"
        );

        let (reply, apologized) = match self.complete_with_retries(&context.messages, &pending.prompt).await {
            Some(reply) => {
                self.last_success = Some(Instant::now());
                (reply, false)
            }
            None => match self.retry.exhausted(Instant::now(), started, self.last_success) {
                Exhausted::Abandon(reason) => {
                    tracing::info!(?reason, "completion failed; leaving slot for a later pass");
                    self.inflight.release(seq);
                    return TickOutcome::Abandoned { seq, reason };
                }
                Exhausted::Apologize => {
                    tracing::warn!("completion failed persistently; posting apology");
                    (APOLOGY.to_string(), true)
                }
            },
        };

        let nickname = match self.log.nickname(&pending.from).await {
            Ok(nickname) => nickname,
            Err(e) => {
                tracing::debug!(error = %e, "nickname lookup failed; tagging by address");
                None
            }
        };
        let tag = self
            .sanitizer
            .resolve_tag(nickname.as_deref(), pending.from.as_str());
        let sanitized = self.sanitizer.sanitize(&reply, &tag);

        let post = ChatEvent::oracle_reply(self.settings.admin.clone(), sanitized.text.clone(), seq);
        if let Err(e) = self.log.append(LogOp::Chat(post)).await {
            tracing::error!(error = %e, "failed to post reply");
            self.inflight.release(seq);
            return TickOutcome::Failed {
                seq: Some(seq),
                stage: Stage::Post,
            };
        }

        // An apology says nothing worth remembering.
        let next_summary = (!apologized).then(|| {
            summary::roll(
                previous_summary.as_deref(),
                &pending.prompt,
                &sanitized.text,
                self.settings.summary_max_bytes,
            )
        });
        let commit = LogOp::OracleResult {
            from: self.settings.admin.clone(),
            commit: ResultCommit {
                queue: pending.kind,
                seq,
                reply: sanitized.text,
                summary: next_summary,
            },
        };
        if let Err(e) = self.log.append(commit).await {
            tracing::error!(error = %e, "failed to commit result after posting");
            self.inflight.release(seq);
            return TickOutcome::Failed {
                seq: Some(seq),
                stage: Stage::Commit,
            };
        }
        self.started = None;

        let committed_visible = self.wait_for_commit(seq).await;
        if committed_visible {
            self.inflight.release(seq);
        } else {
            tracing::warn!("commit not visible locally yet; keeping inflight marker");
        }
        tracing::info!(apologized, trimmed = sanitized.trimmed, "reply posted and committed");

        TickOutcome::Replied {
            seq,
            apologized,
            committed_visible,
        }
    }

    /// Full context first, then the minimal context on each retry.
    async fn complete_with_retries(&self, messages: &[ChatMessage], prompt: &str) -> Option<String> {
        match self.llm.complete(messages).await {
            Ok(completion) => return Some(completion.content),
            Err(e) => tracing::warn!(attempt = 0, error = %e, "completion failed"),
        }

        let minimal = self.composer.minimal(prompt);
        for (attempt, delay) in self.retry.schedule().enumerate() {
            tokio::time::sleep(delay).await;
            match self.llm.complete(&minimal.messages).await {
                Ok(completion) => return Some(completion.content),
                Err(e) => tracing::warn!(attempt = attempt + 1, error = %e, "completion retry failed"),
            }
        }
        None
    }

    /// Answered pairs immediately preceding `seq`, oldest first. Skipped
    /// slots have no done entry and leave a gap.
    async fn history_before(&self, seq: u64) -> Vec<HistoryPair> {
        let window = u64::try_from(self.settings.history_window).unwrap_or(u64::MAX);
        let first = seq.saturating_sub(window).max(1);
        let mut pairs = Vec::new();
        for prior in first..seq {
            match self.log.done(prior).await {
                Ok(Slot::Present(done)) => pairs.push(HistoryPair {
                    prompt: done.prompt,
                    reply: done.reply,
                }),
                Ok(Slot::Missing) => {}
                Ok(Slot::Malformed(error)) => {
                    tracing::debug!(seq = prior, error = %error, "done entry malformed; left out of history");
                }
                Err(e) => {
                    tracing::debug!(seq = prior, error = %e, "failed to read done entry");
                }
            }
        }
        pairs
    }

    async fn wait_for_commit(&self, seq: u64) -> bool {
        let deadline = Instant::now() + self.settings.commit_wait;
        loop {
            match self.log.counters().await {
                Ok(counters) if counters.process_seq >= seq => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "counter read failed while waiting for commit"),
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(COMMIT_POLL_INTERVAL).await;
        }
    }

    async fn skip(&mut self, seq: u64, queue: QueueKind, reason: SkipReason) -> TickOutcome {
        match self.fast_forward(queue, seq).await {
            Ok(()) => {
                self.inflight.release(seq);
                if matches!(self.started, Some((current, _)) if current == seq) {
                    self.started = None;
                }
                TickOutcome::Skipped { seq, reason }
            }
            Err(stage) => TickOutcome::Failed {
                seq: Some(seq),
                stage,
            },
        }
    }

    async fn fast_forward(&self, queue: QueueKind, seq: u64) -> Result<(), Stage> {
        let op = LogOp::Control {
            from: self.settings.admin.clone(),
            control: ControlOp::FastForward { queue, seq },
        };
        self.log.append(op).await.map_err(|e| {
            tracing::error!(seq, error = %e, "failed to append fast-forward");
            Stage::Control
        })
    }
}
