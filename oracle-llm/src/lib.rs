//! Completion client for the chat oracle.
//!
//! Pure HTTP client speaking the OpenAI-style chat completions wire format,
//! with optional auth header, per-request timeout and call diagnostics.

mod client;
mod error;
mod openai;
mod tokens;
mod types;

pub use client::{
    AuthHeader, CallDiagnostics, Complete, CompletionClient, CompletionConfig, DIAGNOSTICS_CAPACITY,
};
pub use error::{LlmError, Result};
pub use tokens::{HeuristicCounter, TokenCounter};
pub use types::{ChatMessage, Completion, Role, Usage};
