use crate::error::{QueueError, Result};
use crate::keys;
use crate::types::SequenceCounters;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Read access to replicated state as seen by the replica applying an entry.
pub trait StateView {
    fn get(&self, key: &str) -> Option<&Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Put { key: String, value: Value },
    Delete { key: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Writes produced by one apply call. The substrate applies a batch as a unit,
/// after the state machine has finished reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    mutations: Vec<Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|source| QueueError::Encode {
            key: key.clone(),
            source,
        })?;
        self.mutations.push(Mutation::Put { key, value });
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.mutations.push(Mutation::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn touches(&self, key: &str) -> bool {
        self.mutations.iter().any(|m| m.key() == key)
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Plain ordered key/value state; what every replica materialises.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    entries: BTreeMap<String, Value>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, batch: Batch) {
        for mutation in batch.into_mutations() {
            match mutation {
                Mutation::Put { key, value } => {
                    self.entries.insert(key, value);
                }
                Mutation::Delete { key } => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Writes a value directly, outside the queue state machine. Used for keys
    /// the chat application owns, such as nicknames.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k)
    }
}

impl StateView for MemoryState {
    fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }
}

/// Integer counters read as zero when absent. A malformed value is treated the
/// same way so replicas never diverge on a panic.
pub fn read_u64(view: &(impl StateView + ?Sized), key: &str) -> u64 {
    match view.get(key) {
        None => 0,
        Some(value) => value.as_u64().unwrap_or_else(|| {
            tracing::warn!(key, value = %value, "non-integer counter treated as zero");
            0
        }),
    }
}

pub fn read_json<T: DeserializeOwned>(view: &(impl StateView + ?Sized), key: &str) -> Option<T> {
    let value = view.get(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, error = %e, "malformed replicated value ignored");
            None
        }
    }
}

pub fn read_counters(view: &(impl StateView + ?Sized)) -> SequenceCounters {
    SequenceCounters {
        message_seq: read_u64(view, keys::MESSAGE_SEQ),
        process_seq: read_u64(view, keys::PROCESS_SEQ),
    }
}
