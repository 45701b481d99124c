//! Filename helpers for turning engine-reported titles into path segments
//! and `Content-Disposition` values.

/// Characters that are illegal in a path segment on at least one of the
/// filesystems we care about.
pub const ILLEGAL_FILENAME_CHARS: &str = "/\\?%*:|\"<>";

/// Removes every character from [`ILLEGAL_FILENAME_CHARS`] and trims
/// surrounding whitespace. Idempotent.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !ILLEGAL_FILENAME_CHARS.contains(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Stricter variant used for single-item downloads: keeps alphanumerics,
/// spaces, hyphens and underscores, then trims trailing whitespace.
pub fn safe_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Builds `<stem>.<ext>`, substituting `fallback` when the stem is empty.
pub fn with_extension(stem: &str, fallback: &str, ext: &str) -> String {
    let stem = if stem.trim().is_empty() { fallback } else { stem };
    format!("{stem}.{ext}")
}

/// `attachment` disposition carrying an ASCII fallback name plus the exact
/// UTF-8 name in `filename*`.
pub fn content_disposition(filename: &str) -> String {
    let ascii = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
