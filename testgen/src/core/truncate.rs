//! Character-boundary safe truncation with an explicit marker.

/// Keep at most `max_chars` characters, appending a marker naming how many were dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(idx, _)| idx);
    format!(
        "{}\n... (truncated {} characters)",
        &text[..cut],
        total - max_chars
    )
}
