use crate::types::ChatMessage;

/// Counts tokens for budgeting. An exact subword tokenizer can be plugged in
/// behind this trait; `HeuristicCounter` is the fallback.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.count(&m.content)).sum()
    }
}

/// ~4 chars per token for English-heavy text.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}
