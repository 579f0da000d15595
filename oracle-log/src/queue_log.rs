use anyhow::Result;
use async_trait::async_trait;
use oracle_queue::{DoneEntry, LogOp, PendingEntry, SequenceCounters, UserId, keys};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A replicated value as read by the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<T> {
    /// Not written yet, or not replicated to this node yet.
    Missing,
    /// Present but not decodable; holds the decode error.
    Malformed(String),
    Present(T),
}

impl<T: DeserializeOwned> Slot<T> {
    pub fn decode(value: Option<Value>) -> Self {
        match value {
            None => Self::Missing,
            Some(v) => match serde_json::from_value(v) {
                Ok(t) => Self::Present(t),
                Err(e) => Self::Malformed(e.to_string()),
            },
        }
    }
}

impl<T> Slot<T> {
    pub fn present(self) -> Option<T> {
        match self {
            Self::Present(t) => Some(t),
            Self::Missing | Self::Malformed(_) => None,
        }
    }
}

#[async_trait]
pub trait QueueLog: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Appends to the global log. Returning `Ok` means the local replica has
    /// accepted the entry, not that every replica has seen it.
    async fn append(&self, op: LogOp) -> Result<()>;

    async fn counters(&self) -> Result<SequenceCounters> {
        let read = |value: Option<Value>| value.and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(SequenceCounters {
            message_seq: read(self.get(keys::MESSAGE_SEQ).await?),
            process_seq: read(self.get(keys::PROCESS_SEQ).await?),
        })
    }

    async fn pending(&self, seq: u64) -> Result<Slot<PendingEntry>> {
        Ok(Slot::decode(self.get(&keys::pending(seq)).await?))
    }

    async fn done(&self, seq: u64) -> Result<Slot<DoneEntry>> {
        Ok(Slot::decode(self.get(&keys::done(seq)).await?))
    }

    async fn summary(&self) -> Result<Option<String>> {
        Ok(Slot::decode(self.get(keys::SUMMARY).await?).present())
    }

    async fn nickname(&self, user: &UserId) -> Result<Option<String>> {
        let nick: Option<String> = Slot::decode(self.get(&keys::nickname(user)).await?).present();
        Ok(nick.filter(|n| !n.trim().is_empty()))
    }
}
