use crate::queue_log::QueueLog;
use anyhow::Result;
use async_trait::async_trait;
use oracle_queue::{
    LogOp, MemoryState, Outcome, QueueConfig, QueueMachine, StateView, UserId, keys,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

/// A log entry together with what the substrate knew when ordering it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedOp {
    pub position: u64,
    pub trusted_time: Option<u64>,
    pub op: LogOp,
}

struct ReplicaInner {
    machine: QueueMachine,
    state: MemoryState,
    trusted_time: Option<u64>,
    log: Vec<LoggedOp>,
}

/// Single-process replica: orders appends, runs the queue state machine on
/// each one and applies the resulting batch atomically.
pub struct MemoryReplica {
    inner: Mutex<ReplicaInner>,
    events: broadcast::Sender<LoggedOp>,
}

impl MemoryReplica {
    pub fn new(cfg: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(ReplicaInner {
                machine: QueueMachine::new(cfg),
                state: MemoryState::new(),
                trusted_time: None,
                log: Vec::new(),
            }),
            events,
        }
    }

    /// Publishes a new trusted time. The time oracle is monotonic, so a value
    /// behind the current one is dropped.
    pub async fn set_trusted_time(&self, now: u64) {
        let mut inner = self.inner.lock().await;
        let current = inner.trusted_time;
        match current {
            Some(current) if now < current => {
                tracing::warn!(current, now, "trusted time went backwards; ignored");
            }
            _ => inner.trusted_time = Some(now),
        }
    }

    pub async fn trusted_time(&self) -> Option<u64> {
        self.inner.lock().await.trusted_time
    }

    pub async fn set_nickname(&self, user: &UserId, nick: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .state
            .insert(keys::nickname(user), Value::String(nick.to_string()));
    }

    /// Orders `op`, applies it and reports what the state machine did.
    #[tracing::instrument(level = "debug", skip_all, fields(author = %op.author()))]
    pub async fn submit(&self, op: LogOp) -> Outcome {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let position = inner.log.len() as u64;
        let trusted_time = inner.trusted_time;
        let outcome = apply_one(&inner.machine, &mut inner.state, &op, position, trusted_time);
        let logged = LoggedOp {
            position,
            trusted_time,
            op,
        };
        inner.log.push(logged.clone());
        drop(guard);

        // Nobody listening is fine.
        let _ = self.events.send(logged);
        outcome
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoggedOp> {
        self.events.subscribe()
    }

    pub async fn log(&self) -> Vec<LoggedOp> {
        self.inner.lock().await.log.clone()
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.inner.lock().await.state.clone()
    }
}

fn apply_one(
    machine: &QueueMachine,
    state: &mut MemoryState,
    op: &LogOp,
    position: u64,
    now: Option<u64>,
) -> Outcome {
    match machine.apply(&*state, op, position, now) {
        Ok(applied) => {
            state.apply(applied.batch);
            applied.outcome
        }
        Err(e) => {
            // Same input fails the same way everywhere; skipping keeps replicas in step.
            tracing::warn!(position, error = %e, "log entry could not be applied; skipped");
            Outcome::Unchanged
        }
    }
}

/// Rebuilds queue state from scratch by replaying `log` in order.
pub fn replay(cfg: QueueConfig, log: &[LoggedOp]) -> MemoryState {
    let machine = QueueMachine::new(cfg);
    let mut state = MemoryState::new();
    for entry in log {
        apply_one(
            &machine,
            &mut state,
            &entry.op,
            entry.position,
            entry.trusted_time,
        );
    }
    state
}

#[async_trait]
impl QueueLog for MemoryReplica {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock().await.state.get(key).cloned())
    }

    async fn append(&self, op: LogOp) -> Result<()> {
        self.submit(op).await;
        Ok(())
    }
}
