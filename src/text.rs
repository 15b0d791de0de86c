//! Small string helpers shared by log/notice formatting and snippet building.

/// Cut `text` to at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Like [`truncate_chars`] but appends an ellipsis when something was cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let cut = truncate_chars(text, max_chars);
    if cut.len() < text.len() {
        format!("{cut}…")
    } else {
        cut.to_string()
    }
}

/// Collapse all whitespace runs to single spaces and cap the length, for
/// embedding upstream error bodies in one-line messages.
pub fn single_line(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars).to_string()
}

/// Strip chat-template control tokens (`<|im_start|>`, `<|endoftext|>`...)
/// from user-supplied text before it goes into a prompt.
pub fn sanitize_for_prompt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<|") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("|>") {
            Some(end) if end <= 32 && !after[..end].contains(char::is_whitespace) => {
                rest = &after[end + 2..];
            }
            _ => {
                out.push_str("<|");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
