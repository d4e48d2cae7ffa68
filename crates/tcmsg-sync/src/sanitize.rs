//! Outgoing message sanitization.

use crate::error::SyncError;

/// Zero-width and bidirectional-override characters, which can hide or
/// reorder text in the peer's view.
fn is_invisible_format(c: char) -> bool {
    matches!(c,
        '\u{200B}'..='\u{200F}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2066}'..='\u{2069}'
        | '\u{FEFF}')
}

/// Normalize line endings, drop control characters other than newline and
/// tab, drop invisible formatting characters, and trim.
pub fn sanitize(input: &str) -> String {
    let normalized = input.replace("\r\n", "\n").replace('\r', "\n");
    let cleaned: String = normalized
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .filter(|&c| !is_invisible_format(c))
        .collect();
    cleaned.trim().to_string()
}

/// Sanitize `input` and check it is non-empty and at most `max_chars`
/// characters long.
pub fn prepare_outgoing(input: &str, max_chars: usize) -> Result<String, SyncError> {
    let text = sanitize(input);
    if text.is_empty() {
        return Err(SyncError::EmptyMessage);
    }
    let chars = text.chars().count();
    if chars > max_chars {
        return Err(SyncError::MessageTooLong {
            chars,
            max: max_chars,
        });
    }
    Ok(text)
}
