//! Helpers for turning raw upstream comment snippets into display-safe
//! values: author fallback, deterministic placeholder avatars, and date
//! formatting for clients that want a pre-rendered string.

use chrono::{DateTime, Utc};

/// Display name used when the upstream snippet carries no author.
pub const ANONYMOUS_AUTHOR: &str = "Anonymous";

const AVATAR_BASE_URL: &str = "https://ui-avatars.com/api/";

/// Returns a usable display name, falling back to [`ANONYMOUS_AUTHOR`] when
/// the upstream value is missing or blank.
pub fn display_author(author: Option<String>) -> String {
    match author {
        Some(name) if !name.trim().is_empty() => name,
        _ => ANONYMOUS_AUTHOR.to_string(),
    }
}

/// Prefers the upstream profile image; otherwise generates a deterministic
/// placeholder derived from the author name, so the same author always gets
/// the same avatar.
pub fn avatar_or_placeholder(upstream: Option<String>, author: &str) -> String {
    match upstream {
        Some(url) if !url.trim().is_empty() => url,
        _ => generate_avatar_url(author),
    }
}

/// Builds the placeholder avatar URL for an author name.
pub fn generate_avatar_url(author: &str) -> String {
    let name = if author.trim().is_empty() { "U" } else { author };
    let encoded: String = form_urlencoded::byte_serialize(name.as_bytes()).collect();
    format!("{AVATAR_BASE_URL}?name={encoded}&background=222&color=fff&size=48")
}

/// Short human-readable date for a comment timestamp, e.g. `Jan 5, 2024`.
pub fn format_comment_date(published_at: DateTime<Utc>) -> String {
    published_at.format("%b %-d, %Y").to_string()
}
