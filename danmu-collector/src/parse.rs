use std::sync::LazyLock;

use chrono::DateTime;
use danmu_common::Comment;
use regex::Regex;
use serde_json::Value;

static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<]+?>").expect("static regex"));
static CANONICAL_TS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").expect("static regex"));

const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const UPSTREAM_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Remove tags and line breaks from a comment body.
pub fn strip_markup(text: &str) -> String {
    MARKUP.replace_all(text, "").replace('\n', "").trim().to_string()
}

/// Canonical `YYYY-MM-DD HH:MM:SS` in the source's own offset; empty if unparseable.
pub fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() || CANONICAL_TS.is_match(raw) {
        return raw.to_string();
    }
    match DateTime::parse_from_str(raw, UPSTREAM_FORMAT) {
        Ok(dt) => dt.format(CANONICAL_FORMAT).to_string(),
        Err(e) => {
            tracing::warn!(raw, error = %e, "unparseable comment timestamp");
            String::new()
        }
    }
}

fn id_of(raw: &Value) -> Option<String> {
    match raw.get("idstr").filter(|v| v.is_string()).or_else(|| raw.get("id"))? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build a `Comment` from one upstream record. Records without an id are skipped.
pub fn parse_comment(raw: &Value, target_id: &str) -> Option<Comment> {
    let id = id_of(raw)?;
    let author = raw
        .pointer("/user/screen_name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let text = raw.get("text").and_then(Value::as_str).unwrap_or_default();
    let created_at = raw
        .get("created_at")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Some(Comment::new(
        id,
        target_id,
        author,
        strip_markup(text),
        normalize_timestamp(created_at),
    ))
}
