//! Normalization contract between game chat text and the external service's
//! markdown. Inbound text is unescaped and stripped of decoration; outbound
//! text has color codes removed and formatting characters escaped so
//! user-authored text cannot inject markup.

/// Characters the service treats as formatting and the relay escapes.
const SPECIAL_CHARS: &[char] = &['\\', '*', '_', '~', '`', '|', '-', '#'];

/// Internal color codes are a marker character followed by one code char.
const COLOR_CODE_MARKER: char = '&';

/// Hard per-message limit imposed by the service.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Escapes every special markdown character with a backslash.
pub fn escape(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for ch in text.chars() {
        if SPECIAL_CHARS.contains(&ch) {
            output.push('\\');
        }
        output.push(ch);
    }
    output
}

/// Reverses [`escape`]: a backslash followed by a special character becomes
/// the bare character. Backslashes before anything else are kept.
pub fn unescape(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.peek().copied() {
                if SPECIAL_CHARS.contains(&next) {
                    output.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        output.push(ch);
    }
    output
}

fn is_variation_selector(ch: char) -> bool {
    matches!(ch, '\u{FE00}'..='\u{FE0F}')
}

/// Removes bare emphasis markers. Escaped characters pass through untouched
/// for [`unescape`] to restore; this is a deliberately simple strip, not a
/// markdown parser.
fn strip_emphasis(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                output.push(ch);
                if let Some(next) = chars.next() {
                    output.push(next);
                }
            }
            '*' | '_' => {}
            _ => output.push(ch),
        }
    }
    output
}

/// Normalizes text received from the external service into plain chat text.
pub fn sanitize_inbound(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|ch| !is_variation_selector(*ch))
        .collect();
    unescape(&strip_emphasis(&stripped))
}

/// Removes internal color-code markers and their code characters.
pub fn strip_color_codes(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch == COLOR_CODE_MARKER {
            chars.next();
            continue;
        }
        output.push(ch);
    }
    output
}

/// Prepares game chat text for the external service.
pub fn sanitize_outbound(text: &str) -> String {
    escape(&strip_color_codes(text))
}

/// Splits text into chunks of at most `max_chars` characters, preserving
/// order.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() || max_chars == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for ch in text.chars() {
        current.push(ch);
        current_len += 1;
        if current_len >= max_chars {
            chunks.push(current);
            current = String::new();
            current_len = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::{
        chunk_message, escape, sanitize_inbound, sanitize_outbound, strip_color_codes, unescape,
    };

    #[test]
    fn unit_escape_round_trips_every_special_character() {
        let original = r"back\slash *star* _under_ ~tilde~ `tick` |pipe| -dash- #hash";
        let escaped = escape(original);
        assert_ne!(escaped, original);
        assert_eq!(unescape(&escaped), original);
        assert_eq!(sanitize_inbound(&escaped), original);
    }

    #[test]
    fn unit_unescape_keeps_unknown_escapes() {
        assert_eq!(unescape(r"a\z b\*"), r"a\z b*");
    }

    #[test]
    fn inbound_strips_emphasis_but_keeps_escaped_characters() {
        assert_eq!(sanitize_inbound("**bold** and _italic_"), "bold and italic");
        assert_eq!(sanitize_inbound(r"literal \* star"), "literal * star");
    }

    #[test]
    fn inbound_strips_variation_selectors() {
        assert_eq!(sanitize_inbound("wave\u{FE0F} hi"), "wave hi");
    }

    #[test]
    fn outbound_strips_color_codes_before_escaping() {
        assert_eq!(strip_color_codes("&aGreen &ctext"), "Green text");
        assert_eq!(sanitize_outbound("&f*hi*"), r"\*hi\*");
    }

    #[test]
    fn color_marker_at_end_of_text_is_dropped() {
        assert_eq!(strip_color_codes("trailing&"), "trailing");
    }

    #[test]
    fn unit_chunking_preserves_order_and_limit() {
        assert_eq!(chunk_message("", 5), Vec::<String>::new());
        assert_eq!(chunk_message("abc", 5), vec!["abc"]);
        assert_eq!(chunk_message("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
    }
}
