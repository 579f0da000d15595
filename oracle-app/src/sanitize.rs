use regex::{NoExpand, Regex};

/// Mentions shaped like a raw account address: hex with a `0x` prefix, a bare
/// hex key, or a long base58 run. A run of markers is prepended at construction.
const ADDRESS_PATTERN: &str =
    r"(0x[0-9a-fA-F]{8,}|[0-9a-fA-F]{32,}|[1-9A-HJ-NP-Za-km-z]{25,})";

const TRIMMED_NOTICE: &str = "(reply trimmed: too long to post)";
const EMPTY_NOTICE: &str = "(no answer)";
const MIN_CUT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedReply {
    pub text: String,
    /// The body was cut or replaced to fit the transport limit.
    pub trimmed: bool,
}

/// Turns raw model output into one safe chat post addressed to the asker.
#[derive(Debug, Clone)]
pub struct ReplySanitizer {
    trigger: String,
    placeholder: Option<Mention>,
    trigger_mention: Mention,
    address_mention: Regex,
    marker: char,
    max_message_bytes: usize,
}

impl ReplySanitizer {
    pub fn new(
        trigger: &str,
        placeholder: &str,
        marker: char,
        max_message_bytes: usize,
    ) -> anyhow::Result<Self> {
        if trigger.trim().is_empty() {
            return Err(anyhow::anyhow!("trigger must not be empty"));
        }
        Ok(Self {
            trigger: trigger.trim().to_string(),
            placeholder: match placeholder.trim() {
                "" => None,
                p => Some(Mention::new(p, marker)?),
            },
            trigger_mention: Mention::new(trigger.trim(), marker)?,
            address_mention: Regex::new(&format!("{}+{ADDRESS_PATTERN}", marker_class(marker)))?,
            marker,
            max_message_bytes,
        })
    }

    /// The asker's nickname, or their address when they have none or their
    /// nickname would read as the trigger word.
    pub fn resolve_tag(&self, nickname: Option<&str>, address: &str) -> String {
        let bare_trigger = self.trigger.trim_start_matches(self.marker);
        match nickname.map(|n| n.trim().trim_start_matches(self.marker)) {
            Some(nick) if !nick.is_empty() && !nick.eq_ignore_ascii_case(bare_trigger) => {
                nick.to_string()
            }
            _ => address.to_string(),
        }
    }

    pub fn sanitize(&self, raw: &str, tag: &str) -> SanitizedReply {
        let body = self.demote(raw.trim(), tag);
        if body.is_empty() {
            return SanitizedReply {
                text: self.address(tag, EMPTY_NOTICE),
                trimmed: false,
            };
        }

        let text = self.address(tag, &body);
        if text.len() <= self.max_message_bytes {
            return SanitizedReply {
                text,
                trimmed: false,
            };
        }

        let mut body: Vec<char> = body.chars().collect();
        loop {
            let cut = (body.len() / 5).max(MIN_CUT_CHARS);
            if cut >= body.len() {
                break;
            }
            body.truncate(body.len() - cut);
            let shortened: String = body.iter().collect();
            let text = self.address(tag, &format!("{}…", shortened.trim_end()));
            if text.len() <= self.max_message_bytes {
                tracing::debug!(
                    bytes = text.len(),
                    limit = self.max_message_bytes,
                    "reply shortened to fit transport"
                );
                return SanitizedReply {
                    text,
                    trimmed: true,
                };
            }
        }

        tracing::warn!(
            limit = self.max_message_bytes,
            "reply could not be shortened to fit; posting notice"
        );
        SanitizedReply {
            text: self.address(tag, TRIMMED_NOTICE),
            trimmed: true,
        }
    }

    fn address(&self, tag: &str, body: &str) -> String {
        format!("{}{tag} {body}", self.marker)
    }

    fn demote(&self, text: &str, tag: &str) -> String {
        let mut text = text.to_string();
        if let Some(placeholder) = &self.placeholder {
            text = placeholder.demote(&text);
        }
        text = self.trigger_mention.demote(&text);
        if let Ok(tag_mention) = Regex::new(&format!(
            "(?i){}+{}",
            marker_class(self.marker),
            regex::escape(tag)
        )) {
            text = tag_mention.replace_all(&text, NoExpand(tag)).into_owned();
        }
        text = self.address_mention.replace_all(&text, "$1").into_owned();
        text.trim().to_string()
    }
}

/// A configured word (trigger or placeholder) matched case-insensitively with
/// any run of markers in front of it.
#[derive(Debug, Clone)]
struct Mention {
    pattern: Regex,
    marker: char,
    /// The configured word starts with the marker, so stripping the markers
    /// is enough to make it inert.
    marked: bool,
}

impl Mention {
    fn new(literal: &str, marker: char) -> anyhow::Result<Self> {
        let bare = literal.trim_start_matches(marker);
        if bare.is_empty() {
            return Err(anyhow::anyhow!("{literal:?} has nothing after the mention marker"));
        }
        let marked = bare.len() < literal.len();
        let markers = if marked { "+" } else { "*" };
        Ok(Self {
            pattern: Regex::new(&format!(
                "(?i){}{markers}{}",
                marker_class(marker),
                regex::escape(bare)
            ))?,
            marker,
            marked,
        })
    }

    fn demote(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let word = caps[0].trim_start_matches(self.marker);
                if self.marked {
                    return word.to_string();
                }
                // Zero-width break after the first char so the word no longer matches.
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => format!("{first}\u{200b}{}", chars.as_str()),
                    None => String::new(),
                }
            })
            .into_owned()
    }
}

fn marker_class(marker: char) -> String {
    format!("(?:{})", regex::escape(&marker.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer(limit: usize) -> ReplySanitizer {
        ReplySanitizer::new("@ai", "@tag", '@', limit).expect("sanitizer")
    }

    #[test]
    fn demotes_placeholder_and_trigger() {
        let s = sanitizer(4000);
        let out = s.sanitize("ask @tag again @ai", "u1");
        assert_eq!(out.text, "@u1 ask tag again ai");
        assert!(!out.trimmed);
    }

    #[test]
    fn trigger_is_demoted_case_insensitively() {
        let s = sanitizer(4000);
        assert_eq!(s.sanitize("hey @AI and @Ai", "bob").text, "@bob hey AI and Ai");
    }

    #[test]
    fn repeated_tag_mentions_collapse_to_the_prefix() {
        let s = sanitizer(4000);
        let out = s.sanitize("@zed, sure thing @zed", "zed");
        assert_eq!(out.text, "@zed zed, sure thing zed");
        assert_eq!(out.text.matches("@zed").count(), 1);
    }

    #[test]
    fn address_mentions_are_demoted() {
        let s = sanitizer(4000);
        let out = s.sanitize("ping @0xdeadbeef00 or @bob", "u1");
        assert_eq!(out.text, "@u1 ping 0xdeadbeef00 or @bob");
    }

    #[test]
    fn stacked_markers_are_demoted_as_one_mention() {
        let s = sanitizer(4000);
        let out = s.sanitize("try @@ai now, or @@@AI, or @@tag", "u1");
        assert_eq!(out.text, "@u1 try ai now, or AI, or tag");
        assert!(!out.text.to_ascii_lowercase().contains("@ai"));
        assert!(!out.text.contains("@tag"));
    }

    #[test]
    fn stacked_markers_before_the_tag_collapse() {
        let s = sanitizer(4000);
        let out = s.sanitize("hi @@zed", "zed");
        assert_eq!(out.text, "@zed hi zed");
    }

    #[test]
    fn bare_hex_key_mentions_are_demoted() {
        let s = sanitizer(4000);
        let key = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";
        let out = s.sanitize(&format!("ping @{key} please, and @@{key}"), "u1");
        assert_eq!(out.text, format!("@u1 ping {key} please, and {key}"));
    }

    #[test]
    fn short_hex_words_stay_mentions() {
        let s = sanitizer(4000);
        assert_eq!(s.sanitize("cc @beef", "u1").text, "@u1 cc @beef");
    }

    #[test]
    fn marker_only_trigger_is_rejected() {
        assert!(ReplySanitizer::new("@@", "@tag", '@', 4000).is_err());
    }

    #[test]
    fn tag_falls_back_to_address() {
        let s = sanitizer(4000);
        assert_eq!(s.resolve_tag(Some("zed"), "0xabc"), "zed");
        assert_eq!(s.resolve_tag(Some("@zed"), "0xabc"), "zed");
        assert_eq!(s.resolve_tag(None, "0xabc"), "0xabc");
        assert_eq!(s.resolve_tag(Some("  "), "0xabc"), "0xabc");
        assert_eq!(s.resolve_tag(Some("AI"), "0xabc"), "0xabc");
        assert_eq!(s.resolve_tag(Some("@ai"), "0xabc"), "0xabc");
    }

    #[test]
    fn empty_reply_gets_a_notice() {
        let s = sanitizer(4000);
        assert_eq!(s.sanitize("   ", "u1").text, "@u1 (no answer)");
    }

    #[test]
    fn long_reply_is_shortened_on_char_boundaries() {
        let s = sanitizer(1000);
        let raw = "é".repeat(2000);
        let out = s.sanitize(&raw, "u1");
        assert!(out.trimmed);
        assert!(out.text.len() <= 1000);
        assert!(out.text.starts_with("@u1 é"));
        assert!(out.text.ends_with('…'));
    }

    #[test]
    fn unshrinkable_reply_is_replaced() {
        let s = sanitizer(64);
        let out = s.sanitize(&"x".repeat(300), "u1");
        assert!(out.trimmed);
        assert_eq!(out.text, format!("@u1 {TRIMMED_NOTICE}"));
    }

    #[test]
    fn trigger_without_marker_is_broken_up() {
        let s = ReplySanitizer::new("oracle:", "@tag", '@', 4000).expect("sanitizer");
        let out = s.sanitize("say Oracle: hi", "u1");
        assert!(!out.text.to_ascii_lowercase().contains("oracle:"));
        assert!(out.text.contains("O\u{200b}racle:"));
        let stacked = s.sanitize("say @@oracle: hi", "u1");
        assert_eq!(stacked.text, "@u1 say o\u{200b}racle: hi");
    }
}
