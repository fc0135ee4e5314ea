//! Log-safe rendering of SQL text and timestamps.
//!
//! SQL literals can carry user data, so anything logged goes through
//! [`sanitize_sql`] first.

use chrono::{DateTime, SecondsFormat};
use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

fn literal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // single-quoted literals with '' escapes
        Regex::new(r"'(?:[^']|'')*'").expect("static regex is valid")
    })
}

/// Replace every string literal with `'?'`
///
/// # Examples
/// ```
/// use sql_tracer::logging::redact_sql_literals;
///
/// assert_eq!(
///     redact_sql_literals("SELECT * FROM users WHERE email = 'a@b.c'"),
///     "SELECT * FROM users WHERE email = '?'"
/// );
/// ```
pub fn redact_sql_literals(sql: &str) -> Cow<'_, str> {
    literal_pattern().replace_all(sql, "'?'")
}

/// Cut SQL to at most `max_len` bytes on a char boundary, appending `...`
pub fn truncate_sql(sql: &str, max_len: usize) -> Cow<'_, str> {
    if sql.len() <= max_len {
        return Cow::Borrowed(sql);
    }
    let mut end = max_len;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}...", &sql[..end]))
}

/// Collapse whitespace, optionally redact literals, then truncate
pub fn sanitize_sql(sql: &str, max_len: usize, redact: bool) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let redacted = if redact {
        redact_sql_literals(&collapsed).into_owned()
    } else {
        collapsed
    };
    truncate_sql(&redacted, max_len).into_owned()
}

/// Render epoch milliseconds as RFC 3339 (UTC, millisecond precision).
///
/// Stateless; safe to call from any thread.
pub fn format_millis(millis: u64) -> String {
    match DateTime::from_timestamp_millis(millis as i64) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}
