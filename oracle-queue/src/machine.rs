use crate::classify::{Classification, classify};
use crate::error::Result;
use crate::keys;
use crate::rate_limit::{RateDecision, RatePolicy};
use crate::state::{Batch, StateView, read_counters, read_json, read_u64};
use crate::types::{
    ChatEvent, ControlOp, DoneEntry, LogOp, PendingEntry, QueueKind, ResultCommit, UserId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Identity the oracle posts and commits as. Its chat messages are never queued.
    pub admin: UserId,
    pub trigger: String,
    pub mention_marker: char,
    #[serde(default)]
    pub rate: RatePolicy,
}

impl QueueConfig {
    pub fn new(admin: impl Into<UserId>) -> Self {
        Self {
            admin: admin.into(),
            trigger: "@ai".to_string(),
            mention_marker: '@',
            rate: RatePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DailyLimit,
    WindowLimit,
    EmptyPrompt,
    /// Result or control op from someone other than the administrator.
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    AdminAuthored,
    OracleReply,
    NoTrustedTime,
    NotAddressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Enqueued { seq: u64, kind: QueueKind },
    Rejected(RejectReason),
    Ignored(IgnoreReason),
    Committed { seq: u64, done_written: bool },
    FastForwarded { from: u64, to: u64 },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub batch: Batch,
    pub outcome: Outcome,
}

impl Applied {
    fn nothing(outcome: Outcome) -> Self {
        Self {
            batch: Batch::new(),
            outcome,
        }
    }
}

/// The replicated queue: admits chat messages, applies oracle results and
/// control ops. Every method reads through `view` and returns the writes
/// instead of performing them.
#[derive(Debug, Clone)]
pub struct QueueMachine {
    cfg: QueueConfig,
}

impl QueueMachine {
    pub fn new(cfg: QueueConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// `position` is the entry's index in the global log and `now` the trusted
    /// time at that point, if the time oracle has published one yet.
    pub fn apply(
        &self,
        view: &(impl StateView + ?Sized),
        op: &LogOp,
        position: u64,
        now: Option<u64>,
    ) -> Result<Applied> {
        match op {
            LogOp::Chat(event) => self.apply_chat(view, event, position, now),
            LogOp::OracleResult { from, commit } => self.apply_result(view, from, commit),
            LogOp::Control { from, control } => self.apply_control(view, from, control),
        }
    }

    pub fn apply_chat(
        &self,
        view: &(impl StateView + ?Sized),
        event: &ChatEvent,
        position: u64,
        now: Option<u64>,
    ) -> Result<Applied> {
        if event.from == self.cfg.admin {
            return Ok(Applied::nothing(Outcome::Ignored(IgnoreReason::AdminAuthored)));
        }
        if event.is_oracle_reply() {
            return Ok(Applied::nothing(Outcome::Ignored(IgnoreReason::OracleReply)));
        }
        let Some(now) = now else {
            return Ok(Applied::nothing(Outcome::Ignored(IgnoreReason::NoTrustedTime)));
        };

        let mut batch = Batch::new();
        batch.put(keys::time(position), &now)?;

        let user = event.from.as_str();
        let day = crate::rate_limit::day_key(now);
        let daily_key = keys::rate_day(user, day);
        let window_key = keys::rate_window(user);
        let daily_count = read_u64(view, &daily_key);
        let window: Vec<u64> = read_json(view, &window_key).unwrap_or_default();

        let snapshot = match self.cfg.rate.check(daily_count, &window, now) {
            RateDecision::Admit(snapshot) => snapshot,
            RateDecision::Reject(reason) => {
                tracing::debug!(user, ?reason, "chat message rate limited");
                return Ok(Applied {
                    batch,
                    outcome: Outcome::Rejected(reason),
                });
            }
        };

        let (kind, prompt) = match classify(
            &event.text,
            &self.cfg.trigger,
            self.cfg.mention_marker,
            now,
        ) {
            Classification::Tagged(prompt) => (QueueKind::Tagged, prompt),
            Classification::Random(prompt) => (QueueKind::Random, prompt),
            Classification::EmptyTagged => {
                return Ok(Applied {
                    batch,
                    outcome: Outcome::Rejected(RejectReason::EmptyPrompt),
                });
            }
            Classification::NotAddressed => {
                return Ok(Applied {
                    batch,
                    outcome: Outcome::Ignored(IgnoreReason::NotAddressed),
                });
            }
        };

        let counters = read_counters(view);
        let next = counters.message_seq + 1;
        let entry = PendingEntry {
            from: event.from.clone(),
            prompt,
            kind,
            timestamp: now,
        };
        let (daily_count, window) = snapshot.record(now, self.cfg.rate.window_max);

        batch.put(keys::pending(next), &entry)?;
        batch.put(window_key, &window)?;
        batch.put(daily_key, &daily_count)?;
        batch.put(keys::MESSAGE_SEQ, &next)?;

        tracing::debug!(user, seq = next, kind = kind.as_str(), "chat message enqueued");
        Ok(Applied {
            batch,
            outcome: Outcome::Enqueued { seq: next, kind },
        })
    }

    /// Applies the oracle's answer for `commit.seq`. This is the only place the
    /// processed pointer moves forward together with a done entry. Re-applying
    /// the same commit only rewrites the pointer and summary with equal values.
    pub fn apply_result(
        &self,
        view: &(impl StateView + ?Sized),
        from: &UserId,
        commit: &ResultCommit,
    ) -> Result<Applied> {
        if *from != self.cfg.admin {
            return Ok(Applied::nothing(Outcome::Rejected(RejectReason::Unauthorized)));
        }

        let counters = read_counters(view);
        let seq = commit.seq;
        let mut batch = Batch::new();

        let pending_key = keys::pending(seq);
        let mut done_written = false;
        if let Some(pending) = read_json::<PendingEntry>(view, &pending_key) {
            if pending.kind != commit.queue {
                tracing::warn!(
                    seq,
                    pending = pending.kind.as_str(),
                    commit = commit.queue.as_str(),
                    "result queue differs from pending entry type"
                );
            }
            batch.put(keys::done(seq), &DoneEntry::resolve(pending, commit.reply.clone()))?;
            batch.delete(pending_key);
            done_written = true;
        }

        // A result for an already passed slot still lands in history, but must
        // not roll back the summary or the pointer.
        let stale = seq < counters.process_seq;
        if let Some(summary) = commit.summary.as_ref().filter(|_| !stale) {
            batch.put(keys::SUMMARY, summary)?;
        }

        let process_seq = seq.min(counters.message_seq).max(counters.process_seq);
        batch.put(keys::PROCESS_SEQ, &process_seq)?;

        Ok(Applied {
            batch,
            outcome: Outcome::Committed { seq, done_written },
        })
    }

    pub fn apply_control(
        &self,
        view: &(impl StateView + ?Sized),
        from: &UserId,
        control: &ControlOp,
    ) -> Result<Applied> {
        if *from != self.cfg.admin {
            return Ok(Applied::nothing(Outcome::Rejected(RejectReason::Unauthorized)));
        }

        match control {
            ControlOp::FastForward { queue, seq } => {
                let counters = read_counters(view);
                let target = (*seq).clamp(counters.process_seq, counters.message_seq);
                if target <= counters.process_seq {
                    return Ok(Applied::nothing(Outcome::Unchanged));
                }
                let mut batch = Batch::new();
                batch.put(keys::PROCESS_SEQ, &target)?;
                tracing::info!(
                    queue = queue.as_str(),
                    from = counters.process_seq,
                    to = target,
                    "processed pointer fast-forwarded"
                );
                Ok(Applied {
                    batch,
                    outcome: Outcome::FastForwarded {
                        from: counters.process_seq,
                        to: target,
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryState;
    use crate::types::SequenceCounters;
    use serde_json::json;

    const T: u64 = 1_700_000_000_000;

    fn machine() -> QueueMachine {
        QueueMachine::new(QueueConfig::new("admin"))
    }

    fn state_with(counters: SequenceCounters) -> MemoryState {
        let mut state = MemoryState::new();
        state.insert(keys::MESSAGE_SEQ, json!(counters.message_seq));
        state.insert(keys::PROCESS_SEQ, json!(counters.process_seq));
        state
    }

    fn chat(
        m: &QueueMachine,
        state: &mut MemoryState,
        from: &str,
        text: &str,
        position: u64,
        now: u64,
    ) -> Outcome {
        let applied = m
            .apply_chat(&*state, &ChatEvent::new(from, text), position, Some(now))
            .expect("apply chat");
        state.apply(applied.batch);
        applied.outcome
    }

    fn pending(state: &MemoryState, seq: u64) -> Option<PendingEntry> {
        read_json(state, &keys::pending(seq))
    }

    #[test]
    fn tagged_message_is_enqueued_at_next_seq() {
        let m = machine();
        let mut state = state_with(SequenceCounters {
            message_seq: 5,
            process_seq: 5,
        });

        let outcome = chat(&m, &mut state, "u1", "@ai price?", 40, T);

        assert_eq!(
            outcome,
            Outcome::Enqueued {
                seq: 6,
                kind: QueueKind::Tagged
            }
        );
        assert_eq!(
            pending(&state, 6),
            Some(PendingEntry {
                from: UserId::new("u1"),
                prompt: "price?".to_string(),
                kind: QueueKind::Tagged,
                timestamp: T,
            })
        );
        assert_eq!(read_counters(&state).message_seq, 6);
        assert_eq!(read_u64(&state, &keys::time(40)), T);
    }

    fn selecting_minute(text: &str, selected: bool) -> u64 {
        (0..2_000u64)
            .map(|minute| T + minute * 60_000)
            .find(|now| crate::classify::random_participation(text, *now) == selected)
            .expect("some minute in range")
    }

    #[test]
    fn untagged_message_is_enqueued_when_picked_at_random() {
        let m = machine();
        let text = "gm everyone";
        let now = selecting_minute(text, true);
        let mut state = state_with(SequenceCounters {
            message_seq: 2,
            process_seq: 2,
        });

        let outcome = chat(&m, &mut state, "u1", text, 9, now);

        assert_eq!(
            outcome,
            Outcome::Enqueued {
                seq: 3,
                kind: QueueKind::Random
            }
        );
        assert_eq!(
            pending(&state, 3),
            Some(PendingEntry {
                from: UserId::new("u1"),
                prompt: text.to_string(),
                kind: QueueKind::Random,
                timestamp: now,
            })
        );
        let stored = state.get(&keys::pending(3)).expect("pending stored");
        assert_eq!(stored["type"], json!("random"));
        assert_eq!(read_counters(&state).message_seq, 3);
        assert_eq!(read_counters(&state).process_seq, 2);
        assert_eq!(
            read_u64(&state, &keys::rate_day("u1", crate::rate_limit::day_key(now))),
            1
        );
        let window: Vec<u64> = read_json(&state, &keys::rate_window("u1")).expect("window");
        assert_eq!(window, vec![now]);
        assert_eq!(read_u64(&state, &keys::time(9)), now);
    }

    #[test]
    fn untagged_message_outside_selection_only_records_time() {
        let m = machine();
        let text = "gm everyone";
        let now = selecting_minute(text, false);
        let mut state = MemoryState::new();

        let outcome = chat(&m, &mut state, "u1", text, 4, now);

        assert_eq!(outcome, Outcome::Ignored(IgnoreReason::NotAddressed));
        assert_eq!(state.len(), 1);
        assert_eq!(read_u64(&state, &keys::time(4)), now);
    }

    #[test]
    fn trigger_prefix_of_a_longer_word_is_not_a_tag() {
        let m = machine();
        let mut state = MemoryState::new();
        let outcome = chat(&m, &mut state, "u1", "@aiden hi", 1, T);
        assert_eq!(outcome, Outcome::Ignored(IgnoreReason::NotAddressed));
        assert!(pending(&state, 1).is_none());
    }

    #[test]
    fn admin_messages_are_never_queued() {
        let m = machine();
        let mut state = MemoryState::new();
        let outcome = chat(&m, &mut state, "admin", "@ai do something", 1, T);
        assert_eq!(outcome, Outcome::Ignored(IgnoreReason::AdminAuthored));
        assert!(state.is_empty());
    }

    #[test]
    fn oracle_replies_are_never_queued() {
        let m = machine();
        let state = MemoryState::new();
        let event = ChatEvent::oracle_reply("someone", "@ai loop?", 3);
        let applied = m
            .apply_chat(&state, &event, 1, Some(T))
            .expect("apply chat");
        assert_eq!(applied.outcome, Outcome::Ignored(IgnoreReason::OracleReply));
        assert!(applied.batch.is_empty());
    }

    #[test]
    fn nothing_happens_without_trusted_time() {
        let m = machine();
        let state = MemoryState::new();
        let applied = m
            .apply_chat(&state, &ChatEvent::new("u1", "@ai hi"), 1, None)
            .expect("apply chat");
        assert_eq!(applied.outcome, Outcome::Ignored(IgnoreReason::NoTrustedTime));
        assert!(applied.batch.is_empty());
    }

    #[test]
    fn timestamp_is_recorded_even_when_rejected() {
        let m = machine();
        let state = MemoryState::new();
        let applied = m
            .apply_chat(&state, &ChatEvent::new("u1", "@ai   "), 9, Some(T))
            .expect("apply chat");
        assert_eq!(applied.outcome, Outcome::Rejected(RejectReason::EmptyPrompt));
        assert_eq!(applied.batch.len(), 1);
        assert!(applied.batch.touches(&keys::time(9)));
    }

    #[test]
    fn eleventh_message_in_window_is_rejected_without_mutation() {
        let m = machine();
        let mut state = MemoryState::new();
        for i in 0..10u64 {
            let outcome = chat(&m, &mut state, "u1", "@ai hi", i, T + i * 1_000);
            assert!(matches!(outcome, Outcome::Enqueued { .. }), "admission {i}");
        }
        let window_before: Vec<u64> =
            read_json(&state, &keys::rate_window("u1")).expect("window stored");
        let day = crate::rate_limit::day_key(T);
        let daily_before = read_u64(&state, &keys::rate_day("u1", day));

        let outcome = chat(&m, &mut state, "u1", "@ai again", 10, T + 30_000);

        assert_eq!(outcome, Outcome::Rejected(RejectReason::WindowLimit));
        assert!(pending(&state, 11).is_none());
        assert_eq!(read_counters(&state).message_seq, 10);
        let window_after: Vec<u64> =
            read_json(&state, &keys::rate_window("u1")).expect("window stored");
        assert_eq!(window_before, window_after);
        assert_eq!(daily_before, read_u64(&state, &keys::rate_day("u1", day)));

        // Another user is unaffected.
        let other = chat(&m, &mut state, "u2", "@ai hi", 11, T + 30_000);
        assert_eq!(
            other,
            Outcome::Enqueued {
                seq: 11,
                kind: QueueKind::Tagged
            }
        );
    }

    #[test]
    fn window_frees_up_after_sixty_seconds() {
        let m = machine();
        let mut state = MemoryState::new();
        for i in 0..10u64 {
            chat(&m, &mut state, "u1", "@ai hi", i, T + i);
        }
        let outcome = chat(&m, &mut state, "u1", "@ai later", 10, T + 60_010);
        assert!(matches!(outcome, Outcome::Enqueued { seq: 11, .. }));
    }

    #[test]
    fn daily_cap_rejects() {
        let m = machine();
        let mut state = MemoryState::new();
        let day = crate::rate_limit::day_key(T);
        state.insert(keys::rate_day("u1", day), json!(1500));
        let outcome = chat(&m, &mut state, "u1", "@ai hi", 1, T);
        assert_eq!(outcome, Outcome::Rejected(RejectReason::DailyLimit));

        // Next UTC day uses a fresh counter.
        let outcome = chat(&m, &mut state, "u1", "@ai hi", 2, T + crate::DAY_MS);
        assert!(matches!(outcome, Outcome::Enqueued { .. }));
    }

    #[test]
    fn result_commit_moves_pending_to_done() {
        let m = machine();
        let mut state = state_with(SequenceCounters {
            message_seq: 0,
            process_seq: 0,
        });
        chat(&m, &mut state, "u1", "@ai price?", 1, T);

        let commit = ResultCommit {
            queue: QueueKind::Tagged,
            seq: 1,
            reply: "@u1 about three".to_string(),
            summary: Some("Q: price? A: about three".to_string()),
        };
        let applied = m
            .apply_result(&state, &UserId::new("admin"), &commit)
            .expect("apply result");
        assert_eq!(
            applied.outcome,
            Outcome::Committed {
                seq: 1,
                done_written: true
            }
        );
        state.apply(applied.batch);

        assert!(pending(&state, 1).is_none());
        let done: DoneEntry = read_json(&state, &keys::done(1)).expect("done entry");
        assert_eq!(done.prompt, "price?");
        assert_eq!(done.reply, "@u1 about three");
        assert_eq!(done.timestamp, T);
        assert_eq!(read_counters(&state).process_seq, 1);
        assert_eq!(
            read_json::<String>(&state, keys::SUMMARY).as_deref(),
            Some("Q: price? A: about three")
        );

        // Replaying the same commit changes nothing.
        let before = state.clone();
        let again = m
            .apply_result(&state, &UserId::new("admin"), &commit)
            .expect("apply result twice");
        assert_eq!(
            again.outcome,
            Outcome::Committed {
                seq: 1,
                done_written: false
            }
        );
        state.apply(again.batch);
        assert_eq!(state, before);
    }

    #[test]
    fn result_from_non_admin_is_rejected() {
        let m = machine();
        let state = state_with(SequenceCounters {
            message_seq: 3,
            process_seq: 0,
        });
        let commit = ResultCommit {
            queue: QueueKind::Tagged,
            seq: 3,
            reply: "spoof".to_string(),
            summary: None,
        };
        let applied = m
            .apply_result(&state, &UserId::new("mallory"), &commit)
            .expect("apply result");
        assert_eq!(applied.outcome, Outcome::Rejected(RejectReason::Unauthorized));
        assert!(applied.batch.is_empty());
    }

    #[test]
    fn stale_result_keeps_pointer_and_summary() {
        let m = machine();
        let mut state = state_with(SequenceCounters {
            message_seq: 6,
            process_seq: 5,
        });
        state.insert(keys::SUMMARY, json!("fresh"));
        state.insert(
            keys::pending(2),
            serde_json::to_value(PendingEntry {
                from: UserId::new("u1"),
                prompt: "old".to_string(),
                kind: QueueKind::Random,
                timestamp: T,
            })
            .expect("encode pending"),
        );
        let commit = ResultCommit {
            queue: QueueKind::Random,
            seq: 2,
            reply: "late answer".to_string(),
            summary: Some("stale".to_string()),
        };
        let applied = m
            .apply_result(&state, &UserId::new("admin"), &commit)
            .expect("apply result");
        state.apply(applied.batch);

        assert_eq!(read_counters(&state).process_seq, 5);
        assert_eq!(read_json::<String>(&state, keys::SUMMARY).as_deref(), Some("fresh"));
        assert!(read_json::<DoneEntry>(&state, &keys::done(2)).is_some());
    }

    #[test]
    fn fast_forward_is_clamped_to_queue() {
        let m = machine();
        let admin = UserId::new("admin");
        let mut state = state_with(SequenceCounters {
            message_seq: 10,
            process_seq: 4,
        });

        let ff = |seq| ControlOp::FastForward {
            queue: QueueKind::Tagged,
            seq,
        };

        let applied = m.apply_control(&state, &admin, &ff(2)).expect("ff backwards");
        assert_eq!(applied.outcome, Outcome::Unchanged);
        assert!(applied.batch.is_empty());

        let applied = m.apply_control(&state, &admin, &ff(99)).expect("ff past end");
        assert_eq!(applied.outcome, Outcome::FastForwarded { from: 4, to: 10 });
        state.apply(applied.batch);
        assert_eq!(read_counters(&state).process_seq, 10);
    }

    #[test]
    fn pointer_invariants_hold_over_a_mixed_replay() {
        let m = machine();
        let admin = UserId::new("admin");
        let mut state = MemoryState::new();
        let mut last_process = 0;
        for i in 0..60u64 {
            let now = T + i * 7_000;
            let op = match i % 5 {
                0 | 1 => LogOp::Chat(ChatEvent::new(format!("u{}", i % 3), "@ai q")),
                2 => LogOp::OracleResult {
                    from: admin.clone(),
                    commit: ResultCommit {
                        queue: QueueKind::Tagged,
                        seq: i / 2,
                        reply: "a".to_string(),
                        summary: None,
                    },
                },
                3 => LogOp::Control {
                    from: admin.clone(),
                    control: ControlOp::FastForward {
                        queue: QueueKind::Tagged,
                        seq: i / 3,
                    },
                },
                _ => LogOp::Chat(ChatEvent::new("admin", "@ai ignored")),
            };
            let applied = m.apply(&state, &op, i, Some(now)).expect("apply op");
            state.apply(applied.batch);

            let counters = read_counters(&state);
            assert!(counters.process_seq <= counters.message_seq, "step {i}");
            assert!(counters.process_seq >= last_process, "step {i}");
            last_process = counters.process_seq;
            for seq in 1..=counters.message_seq {
                let has_pending = state.get(&keys::pending(seq)).is_some();
                let has_done = state.get(&keys::done(seq)).is_some();
                assert!(!(has_pending && has_done), "seq {seq} both pending and done");
            }
        }
    }
}
