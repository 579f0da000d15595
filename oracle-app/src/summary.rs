//! Rolling conversation summary carried in the replicated state.
//!
//! Each answered question appends one `Q: ... | A: ...` line; the oldest
//! lines fall off once the summary outgrows its byte ceiling.

const PROMPT_CHARS: usize = 160;
const REPLY_CHARS: usize = 240;

pub fn roll(previous: Option<&str>, prompt: &str, reply: &str, max_bytes: usize) -> String {
    let line = format!(
        "Q: {} | A: {}",
        squash(prompt, PROMPT_CHARS),
        squash(reply, REPLY_CHARS)
    );
    let mut combined = match previous.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prev) => format!("{prev}\n{line}"),
        None => line,
    };

    while combined.len() > max_bytes {
        match combined.find('\n') {
            Some(idx) => {
                combined.drain(..=idx);
            }
            None => return keep_tail_bytes(&combined, max_bytes),
        }
    }
    combined
}

/// Collapses whitespace to single spaces and caps the length in chars.
fn squash(text: &str, max_chars: usize) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.chars().count() <= max_chars {
        return joined;
    }
    let mut out: String = joined.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn keep_tail_bytes(text: &str, max_bytes: usize) -> String {
    let mut start = text.len().saturating_sub(max_bytes);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
