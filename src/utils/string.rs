/// Clip to at most `max_bytes` without splitting a UTF-8 sequence: back
/// the cut point up until it lands on a character boundary.
fn clip(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Enforce a byte budget on tool output, observations and event bodies.
///
/// The marker keeps the cut visible: the model (and anyone reading the
/// event stream) sees that content was dropped, not that it was absent.
pub fn truncate_with_marker(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    format!("{}...[truncated]", clip(s, max_len))
}

/// Budget a prompt fragment, preferring to cut at whitespace or sentence
/// punctuation so the clipped tail still reads as text.
pub fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let hard = clip(s, max_len.saturating_sub(3));
    let cut = hard.rfind([' ', '\t', '\n', '.', ',']).unwrap_or(hard.len());
    format!("{}...", &hard[..cut])
}
