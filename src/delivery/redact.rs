//! Secret redaction for error strings and logs.

use std::sync::LazyLock;

use regex::Regex;

static DISCORD_WEBHOOK_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://(?:ptb\.|canary\.)?discord(?:app)?\.com/api/webhooks/\d+/)\S+")
        .expect("static webhook token regex")
});

static TELEGRAM_BOT_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(api\.telegram\.org/(?:file/)?bot)[^/\s]+").expect("static bot token regex")
});

/// Remove webhook and bot tokens from `text`.
pub fn redact_secrets(text: &str) -> String {
    let text = DISCORD_WEBHOOK_TOKEN_RE.replace_all(text, "${1}[REDACTED]");
    TELEGRAM_BOT_TOKEN_RE
        .replace_all(&text, "${1}[REDACTED]")
        .into_owned()
}

/// Truncate to at most `max` characters, ending in `...` when cut.
pub fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Truncate to at most `max` characters without a marker.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
