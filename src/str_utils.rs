use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Log-friendly preview of a chunk: at most `n` characters, newlines escaped.
pub fn preview(s: &str, n: usize) -> Cow<'_, str> {
    let head = prefix_chars(s, n);
    let truncated = head.len() < s.len();
    if !truncated && !head.contains('\n') {
        return Cow::Borrowed(head);
    }
    let mut out = head.replace('\n', "\\n");
    if truncated {
        out.push_str("...");
    }
    Cow::Owned(out)
}
