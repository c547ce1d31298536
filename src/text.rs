use std::borrow::Cow;

/// Slugs are capped so directory names stay manageable even for very long
/// titles. The slug crate emits ASCII only, so byte slicing is safe.
const SLUG_MAX: usize = 64;

/// Characters kept in a message excerpt before truncation.
const EXCERPT_CHARS: usize = 180;

/// Derive a filesystem- and URL-safe slug from free-form text.
/// Empty or symbol-only input falls back to "untitled".
pub fn slugify(text: &str) -> String {
    let raw = slug::slugify(text);
    let cut = raw[..raw.len().min(SLUG_MAX)]
        .trim_end_matches('-')
        .to_string();
    if cut.is_empty() { "untitled".to_string() } else { cut }
}

/// Slug for a message's section directory: `NNN-<title or first line>`.
/// The zero-padded ordinal keeps section directories in display order and
/// makes slugs unique within a conversation.
pub fn message_slug(ordinal: u32, title: Option<&str>, content: &str) -> String {
    let base: Cow<'_, str> = match title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => Cow::Borrowed(t),
        None => Cow::Borrowed(content.trim().lines().next().unwrap_or("")),
    };
    let base: String = base.chars().take(80).collect();
    if base.trim().is_empty() {
        slugify(&format!("{:03}-message-{}", ordinal, ordinal))
    } else {
        slugify(&format!("{:03}-{}", ordinal, base))
    }
}

/// Canonical form used for content hashing: trimmed, lowercased, runs of
/// whitespace collapsed to a single space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn count_words(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

/// Truncated single-line preview of a message body.
pub fn excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_CHARS {
        collapsed
    } else {
        let mut cut: String = collapsed.chars().take(EXCERPT_CHARS - 1).collect();
        cut.push('…');
        cut
    }
}
