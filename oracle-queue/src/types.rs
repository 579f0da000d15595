use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(UserId);

/// Both queues share one physical sequence space; the kind only records why
/// a message was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Tagged,
    Random,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tagged => "tagged",
            Self::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounters {
    /// Last assigned queue slot.
    pub message_seq: u64,
    /// Last fully committed (or skipped) slot.
    pub process_seq: u64,
}

impl SequenceCounters {
    pub fn backlog(&self) -> u64 {
        self.message_seq.saturating_sub(self.process_seq)
    }

    /// Next slot the oracle should work on, if any.
    pub fn next_unprocessed(&self) -> Option<u64> {
        (self.process_seq < self.message_seq).then(|| self.process_seq + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub from: UserId,
    pub prompt: String,
    #[serde(rename = "type")]
    pub kind: QueueKind,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEntry {
    pub from: UserId,
    pub prompt: String,
    pub reply: String,
    pub timestamp: u64,
}

impl DoneEntry {
    pub fn resolve(pending: PendingEntry, reply: impl Into<String>) -> Self {
        Self {
            from: pending.from,
            prompt: pending.prompt,
            reply: reply.into(),
            timestamp: pending.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    /// Marks a chat message as the oracle's reply to queue slot `seq`.
    OracleReply { seq: u64 },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub from: UserId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChatEvent {
    pub fn new(from: impl Into<UserId>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn oracle_reply(from: impl Into<UserId>, text: impl Into<String>, seq: u64) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            attachments: vec![Attachment::OracleReply { seq }],
        }
    }

    pub fn is_oracle_reply(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| matches!(a, Attachment::OracleReply { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCommit {
    pub queue: QueueKind,
    pub seq: u64,
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlOp {
    FastForward { queue: QueueKind, seq: u64 },
}

/// One entry of the replicated log, in global order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogOp {
    Chat(ChatEvent),
    OracleResult { from: UserId, commit: ResultCommit },
    Control { from: UserId, control: ControlOp },
}

impl LogOp {
    pub fn author(&self) -> &UserId {
        match self {
            Self::Chat(event) => &event.from,
            Self::OracleResult { from, .. } | Self::Control { from, .. } => from,
        }
    }
}
