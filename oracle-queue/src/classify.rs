//! Decides whether a chat message is addressed to the oracle.

const RANDOM_MODULUS: u64 = 1_000_003;
const RANDOM_ONE_IN: u64 = 20;
const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Message carried the trigger token; holds the text after it.
    Tagged(String),
    /// Untagged message picked for random participation.
    Random(String),
    /// Trigger present but nothing after it.
    EmptyTagged,
    NotAddressed,
}

/// Text after the first case-insensitive occurrence of `trigger`, trimmed and
/// with one leading colon removed. `None` when the trigger does not occur.
///
/// A trigger ending in a word character only counts when no word character
/// follows it, so `@aiden` does not carry `@ai`.
pub fn extract_tagged_prompt(text: &str, trigger: &str) -> Option<String> {
    if trigger.is_empty() {
        return None;
    }
    // ASCII lowering keeps byte offsets identical to `text`.
    let haystack = text.to_ascii_lowercase();
    let needle = trigger.to_ascii_lowercase();
    let bounded = needle.ends_with(is_word_char);
    let end = haystack
        .match_indices(&needle)
        .map(|(idx, _)| idx + needle.len())
        .find(|end| !bounded || !text[*end..].starts_with(is_word_char))?;
    let rest = text[end..].trim();
    let rest = rest.strip_prefix(':').unwrap_or(rest).trim();
    Some(rest.to_string())
}

/// Reproducible ~5% selection: a function of the message text and the
/// minute bucket of the trusted time only.
pub fn random_participation(text: &str, now: u64) -> bool {
    let char_sum = text
        .chars()
        .fold(0u64, |acc, c| (acc + u64::from(u32::from(c))) % RANDOM_MODULUS);
    let combined = (char_sum + (now / MINUTE_MS) % RANDOM_MODULUS) % RANDOM_MODULUS;
    combined % RANDOM_ONE_IN == 0
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

pub fn classify(text: &str, trigger: &str, mention_marker: char, now: u64) -> Classification {
    if let Some(prompt) = extract_tagged_prompt(text, trigger) {
        if prompt.is_empty() {
            return Classification::EmptyTagged;
        }
        return Classification::Tagged(prompt);
    }

    if text.contains(mention_marker) {
        return Classification::NotAddressed;
    }

    let prompt = text.trim();
    if prompt.is_empty() || !random_participation(text, now) {
        return Classification::NotAddressed;
    }
    Classification::Random(prompt.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_after_trigger() {
        assert_eq!(
            extract_tagged_prompt("@ai price?", "@ai").as_deref(),
            Some("price?")
        );
        assert_eq!(
            extract_tagged_prompt("hey @AI: what now ", "@ai").as_deref(),
            Some("what now")
        );
        assert_eq!(extract_tagged_prompt("no mention", "@ai"), None);
    }

    #[test]
    fn only_first_occurrence_is_split() {
        assert_eq!(
            extract_tagged_prompt("@ai tell @ai hi", "@ai").as_deref(),
            Some("tell @ai hi")
        );
    }

    #[test]
    fn trigger_must_end_at_a_word_boundary() {
        assert_eq!(extract_tagged_prompt("@aiden hi", "@ai"), None);
        assert_eq!(extract_tagged_prompt("@ai_bot hi", "@ai"), None);
        assert_eq!(
            extract_tagged_prompt("@aiden meet @ai: hello", "@ai").as_deref(),
            Some("hello")
        );
        assert_eq!(extract_tagged_prompt("ask @ai", "@ai").as_deref(), Some(""));
        assert_eq!(
            extract_tagged_prompt("oracle:now", "oracle:").as_deref(),
            Some("now")
        );
    }

    #[test]
    fn untagged_text_is_classified_random_in_a_selecting_minute() {
        let text = "gm everyone";
        let now = (0..2_000u64)
            .map(|minute| minute * MINUTE_MS)
            .find(|now| random_participation(text, *now))
            .expect("a selecting minute");
        assert_eq!(
            classify(text, "@ai", '@', now),
            Classification::Random(text.to_string())
        );
    }

    #[test]
    fn empty_tagged_prompt_is_flagged() {
        assert_eq!(classify("@ai :  ", "@ai", '@', 0), Classification::EmptyTagged);
    }

    #[test]
    fn messages_with_other_mentions_never_go_random() {
        for minute in 0..40u64 {
            assert_eq!(
                classify("hi @bob", "@ai", '@', minute * MINUTE_MS),
                Classification::NotAddressed
            );
        }
    }

    #[test]
    fn random_participation_is_reproducible_and_bucketed() {
        let text = "gm everyone";
        let now = 1_700_000_000_000;
        let first = random_participation(text, now);
        assert_eq!(first, random_participation(text, now));
        // Same minute bucket, same verdict.
        let bucket_start = now - now % MINUTE_MS;
        assert_eq!(
            random_participation(text, bucket_start),
            random_participation(text, bucket_start + MINUTE_MS - 1)
        );
    }

    #[test]
    fn random_participation_selects_roughly_one_in_twenty() {
        let selected = (0..2_000u64)
            .filter(|minute| random_participation("hello there", minute * MINUTE_MS))
            .count();
        assert_eq!(selected, 100);
    }
}
