use crate::config::ContextConfig;
use oracle_llm::{ChatMessage, TokenCounter};
use std::collections::VecDeque;
use std::sync::Arc;

/// Model name, sampling params and JSON framing around the message list.
const REQUEST_OVERHEAD_BYTES: usize = 128;
/// `{"role":"","content":""},`
const MESSAGE_OVERHEAD_BYTES: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_context_tokens: usize,
    pub max_reply_tokens: usize,
    pub headroom_tokens: usize,
    pub summary_max_tokens: usize,
    pub max_request_bytes: usize,
    pub summary_floor_chars: usize,
    pub prompt_floor_chars: usize,
}

impl ContextLimits {
    /// Tokens available to the request once the reply and headroom are reserved.
    pub fn token_budget(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.max_reply_tokens)
            .saturating_sub(self.headroom_tokens)
    }
}

impl From<&ContextConfig> for ContextLimits {
    fn from(cfg: &ContextConfig) -> Self {
        Self {
            max_context_tokens: cfg.max_context_tokens,
            max_reply_tokens: cfg.max_reply_tokens,
            headroom_tokens: cfg.headroom_tokens,
            summary_max_tokens: cfg.summary_max_tokens,
            max_request_bytes: cfg.max_request_bytes,
            summary_floor_chars: cfg.summary_floor_chars,
            prompt_floor_chars: cfg.prompt_floor_chars,
        }
    }
}

/// One answered question from the done records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPair {
    pub prompt: String,
    pub reply: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedContext {
    pub messages: Vec<ChatMessage>,
    pub tokens: usize,
    pub request_bytes: usize,
    pub dropped_pairs: usize,
    /// False when even the fully trimmed context exceeds a limit.
    pub fits: bool,
}

struct Parts {
    summary: String,
    history: VecDeque<HistoryPair>,
    prompt: String,
}

/// Builds the message list for one completion request.
#[derive(Clone)]
pub struct ContextComposer {
    persona: String,
    limits: ContextLimits,
    counter: Arc<dyn TokenCounter>,
}

impl ContextComposer {
    pub fn new(persona: impl Into<String>, limits: ContextLimits, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            persona: persona.into(),
            limits,
            counter,
        }
    }

    /// `history` is oldest first.
    pub fn compose(
        &self,
        summary: Option<&str>,
        history: Vec<HistoryPair>,
        prompt: &str,
    ) -> ComposedContext {
        let mut summary = summary.unwrap_or("").trim().to_string();
        while self.counter.count(&summary) > self.limits.summary_max_tokens {
            match shrink_keep_tail(&summary, 20, 0) {
                Some(shorter) => summary = shorter,
                None => break,
            }
        }

        let offered_pairs = history.len();
        let mut parts = Parts {
            summary,
            history: history.into(),
            prompt: prompt.to_string(),
        };

        let budget = self.limits.token_budget();
        self.fit(&mut parts, |messages| {
            self.counter.count_messages(messages) > budget
        });
        let max_bytes = self.limits.max_request_bytes;
        self.fit(&mut parts, |messages| {
            estimate_request_bytes(messages) > max_bytes
        });

        let messages = self.render(&parts);
        let tokens = self.counter.count_messages(&messages);
        let request_bytes = estimate_request_bytes(&messages);
        let dropped_pairs = offered_pairs - parts.history.len();
        let fits = tokens <= budget && request_bytes <= max_bytes;
        if dropped_pairs > 0 || !fits {
            tracing::debug!(
                tokens,
                budget,
                request_bytes,
                dropped_pairs,
                summary_chars = parts.summary.chars().count(),
                prompt_chars = parts.prompt.chars().count(),
                fits,
                "context trimmed"
            );
        }

        ComposedContext {
            messages,
            tokens,
            request_bytes,
            dropped_pairs,
            fits,
        }
    }

    /// Persona and prompt only; used when retrying after a failed call.
    pub fn minimal(&self, prompt: &str) -> ComposedContext {
        self.compose(None, Vec::new(), prompt)
    }

    /// Oldest pairs go first, then the summary in 20% steps, then the prompt
    /// in 10% steps. Each step strictly shortens something, so this ends.
    fn fit(&self, parts: &mut Parts, over: impl Fn(&[ChatMessage]) -> bool) {
        while over(&self.render(parts)) && parts.history.pop_front().is_some() {}

        while over(&self.render(parts)) {
            match shrink_keep_tail(&parts.summary, 20, self.limits.summary_floor_chars) {
                Some(shorter) => parts.summary = shorter,
                None => break,
            }
        }

        while over(&self.render(parts)) {
            match shrink_keep_head(&parts.prompt, 10, self.limits.prompt_floor_chars) {
                Some(shorter) => parts.prompt = shorter,
                None => break,
            }
        }
    }

    fn render(&self, parts: &Parts) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(3 + parts.history.len() * 2);
        messages.push(ChatMessage::system(self.persona.as_str()));
        if !parts.summary.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Conversation so far:\n{}",
                parts.summary
            )));
        }
        for pair in &parts.history {
            messages.push(ChatMessage::user(pair.prompt.as_str()));
            messages.push(ChatMessage::assistant(pair.reply.as_str()));
        }
        messages.push(ChatMessage::user(parts.prompt.as_str()));
        messages
    }
}

/// Serialized size of a request carrying `messages`, JSON escaping included.
pub fn estimate_request_bytes(messages: &[ChatMessage]) -> usize {
    messages.iter().fold(REQUEST_OVERHEAD_BYTES, |acc, m| {
        acc + MESSAGE_OVERHEAD_BYTES + m.role.as_str().len() + escaped_len(&m.content)
    })
}

fn escaped_len(s: &str) -> usize {
    s.chars()
        .map(|c| match c {
            '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
            c if (c as u32) < 0x20 => 6,
            c => c.len_utf8(),
        })
        .sum()
}

/// Drops `percent` of the chars from the front, never going below `floor`.
/// `None` once nothing more can be dropped.
fn shrink_keep_tail(text: &str, percent: usize, floor: usize) -> Option<String> {
    let keep = shrunk_len(text, percent, floor)?;
    let skip = text.chars().count() - keep;
    Some(text.chars().skip(skip).collect())
}

fn shrink_keep_head(text: &str, percent: usize, floor: usize) -> Option<String> {
    let keep = shrunk_len(text, percent, floor)?;
    Some(text.chars().take(keep).collect())
}

fn shrunk_len(text: &str, percent: usize, floor: usize) -> Option<usize> {
    let len = text.chars().count();
    if len <= floor {
        return None;
    }
    let cut = (len * percent / 100).max(1);
    Some(len.saturating_sub(cut).max(floor))
}
