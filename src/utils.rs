pub const MAX_MESSAGE_CHARS: usize = 160;

/// Caps a diagnostic at `MAX_MESSAGE_CHARS` characters.
pub fn bounded_message(message: String) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message,
    }
}

/// First `max` characters of `s`, never splitting a code point.
pub fn clip(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
