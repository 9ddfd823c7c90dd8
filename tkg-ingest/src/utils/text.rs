//! String helpers for names, sentences and model output.

use std::sync::LazyLock;

use regex::Regex;

static RUNS_OF_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

// Terminal punctuation, optional closing quotes or brackets, then whitespace.
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.!?]+["')\]]*\s+"#).expect("valid regex"));

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z]*[ \t]*\n(.*?)```").expect("valid regex")
});

/// Collapse whitespace runs into single spaces and trim both ends.
pub fn normalize_whitespace(s: &str) -> String {
    RUNS_OF_SPACE.replace_all(s.trim(), " ").into_owned()
}

/// Canonical lookup key for a name: whitespace-normalized, lowercased, with
/// trailing punctuation removed (`"Acme Corp."` and `"acme  corp"` collide).
pub fn normalize_key(s: &str) -> String {
    normalize_whitespace(s)
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

/// Byte offsets at which sentences end.
///
/// Each offset points just past the whitespace that follows the terminal
/// punctuation, so slicing the input at these offsets keeps the whitespace
/// with the preceding sentence. The final offset is always `s.len()`.
pub fn sentence_boundaries(s: &str) -> Vec<usize> {
    let mut ends: Vec<usize> = SENTENCE_END.find_iter(s).map(|m| m.end()).collect();
    if ends.last() != Some(&s.len()) {
        ends.push(s.len());
    }
    ends
}

/// At most `max_chars` characters of `s`. When text is cut, the last three
/// kept characters become `...` (or fewer dots if `max_chars < 3`).
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some(_) if max_chars <= 3 => ".".repeat(max_chars),
        Some(_) => {
            let cut = s
                .char_indices()
                .nth(max_chars - 3)
                .map_or(s.len(), |(at, _)| at);
            format!("{}...", &s[..cut])
        }
    }
}

/// The JSON document inside a model answer.
///
/// Models sometimes wrap their answer in a markdown fence or surround it with
/// prose. The fence body wins; otherwise the span from the first opening
/// brace or bracket to the matching last closer is taken. Text with neither
/// is returned trimmed, leaving the parse error to the caller.
pub fn json_payload(s: &str) -> &str {
    if let Some(body) = FENCED_BLOCK.captures(s).and_then(|c| c.get(1)) {
        let body = body.as_str().trim();
        if !body.is_empty() {
            return body;
        }
    }
    let Some(open) = s.find(['{', '[']) else {
        return s.trim();
    };
    let closer = if s[open..].starts_with('{') { '}' } else { ']' };
    match s.rfind(closer) {
        Some(close) if close > open => &s[open..=close],
        _ => s.trim(),
    }
}
