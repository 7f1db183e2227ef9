use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::context::types::ContextError;

/// Upper bound on message content, in characters, after sanitization.
pub const MAX_CONTENT_CHARS: usize = 10_000;
/// Upper bound on a serialized memory value, in bytes.
pub const MAX_MEMORY_VALUE_BYTES: usize = 1_024 * 1_024;

const TRUNCATION_MARKER: &str = "[truncated]";

static SESSION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^session_[0-9a-f]{16}$").expect("session id regex"));
static AGENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("agent id regex"));

/// Characters never allowed in a memory key.
const FORBIDDEN_KEY_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// HTML-escapes, collapses runs of whitespace, trims, and truncates to
/// `MAX_CONTENT_CHARS` with an explicit marker.
pub fn sanitize_text(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }

    let collapsed = escaped.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_CONTENT_CHARS {
        return collapsed;
    }
    let keep = MAX_CONTENT_CHARS - TRUNCATION_MARKER.len() - 1;
    let mut out: String = collapsed.chars().take(keep).collect();
    out.push(' ');
    out.push_str(TRUNCATION_MARKER);
    out
}

fn sanitize_scalar(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => Some(value.clone()),
        Value::String(s) => Some(Value::String(sanitize_text(s))),
        _ => None,
    }
}

fn sanitize_shallow(value: &Value) -> Option<Value> {
    match value {
        Value::Array(items) => {
            let kept: Vec<Value> = items.iter().take(20).filter_map(sanitize_scalar).collect();
            Some(Value::Array(kept))
        }
        Value::Object(map) => {
            let mut kept = serde_json::Map::new();
            for (k, v) in map.iter().take(10) {
                if k.len() > 100 {
                    continue;
                }
                if let Some(clean) = sanitize_scalar(v) {
                    kept.insert(sanitize_text(k), clean);
                }
            }
            Some(Value::Object(kept))
        }
        scalar => sanitize_scalar(scalar),
    }
}

/// Scrubs caller-supplied metadata. Scalars pass through (strings
/// sanitized); lists are capped at 20 entries and maps at 10 entries with
/// 100-char keys. Structures nested deeper than one level are dropped
/// silently.
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut kept = serde_json::Map::new();
            for (k, v) in map.iter().take(10) {
                if k.len() > 100 {
                    continue;
                }
                if let Some(clean) = sanitize_shallow(v) {
                    kept.insert(sanitize_text(k), clean);
                }
            }
            Value::Object(kept)
        }
        Value::Array(items) => {
            Value::Array(items.iter().take(20).filter_map(sanitize_shallow).collect())
        }
        scalar => sanitize_scalar(scalar).unwrap_or(Value::Null),
    }
}

pub fn validate_session_id(id: &str) -> Result<(), ContextError> {
    if SESSION_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ContextError::Validation(format!(
            "Invalid session ID format: expected session_<16 hex chars>, got '{}'",
            sanitize_text(id)
        )))
    }
}

pub fn validate_agent_id(id: &str) -> Result<(), ContextError> {
    if AGENT_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ContextError::Validation(
            "Invalid agent ID: 1-64 characters from [a-zA-Z0-9_-]".to_string(),
        ))
    }
}

pub fn validate_memory_key(key: &str) -> Result<(), ContextError> {
    let len = key.chars().count();
    if len == 0 || len > 255 {
        return Err(ContextError::Validation(
            "Memory key must be 1-255 characters".to_string(),
        ));
    }
    if key.chars().any(|c| FORBIDDEN_KEY_CHARS.contains(&c)) {
        return Err(ContextError::Validation(
            "Memory key contains forbidden characters (/ \\ : * ? \" < > |)".to_string(),
        ));
    }
    Ok(())
}

/// Message content must be non-empty after sanitization and within bounds.
pub fn validate_content(sanitized: &str) -> Result<(), ContextError> {
    let len = sanitized.chars().count();
    if len == 0 {
        return Err(ContextError::Validation(
            "Message content must not be empty".to_string(),
        ));
    }
    if len > MAX_CONTENT_CHARS {
        return Err(ContextError::Validation(format!(
            "Message content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_escapes_html() {
        assert_eq!(
            sanitize_text("<script>alert('x')</script>"),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt;"
        );
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_text("  a \t b\n\n c  "), "a b c");
    }

    #[test]
    fn sanitize_truncates_with_marker() {
        let long = "x".repeat(20_000);
        let out = sanitize_text(&long);
        assert!(out.chars().count() <= MAX_CONTENT_CHARS);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn sanitize_json_drops_deep_structures() {
        let input = json!({
            "ok": "value",
            "n": 3,
            "list": [1, 2, {"too": "deep"}],
            "nested": {"inner": {"way": "too deep"}}
        });
        let out = sanitize_json(&input);
        assert_eq!(out["ok"], "value");
        assert_eq!(out["n"], 3);
        assert_eq!(out["list"], json!([1, 2]));
        assert_eq!(out["nested"], json!({}));
    }

    #[test]
    fn sanitize_json_caps_collection_sizes() {
        let big_list: Vec<i64> = (0..50).collect();
        let out = sanitize_json(&json!(big_list));
        assert_eq!(out.as_array().unwrap().len(), 20);

        let mut big_map = serde_json::Map::new();
        for i in 0..30 {
            big_map.insert(format!("k{i}"), json!(i));
        }
        let out = sanitize_json(&Value::Object(big_map));
        assert_eq!(out.as_object().unwrap().len(), 10);
    }

    #[test]
    fn session_id_format() {
        assert!(validate_session_id("session_0123456789abcdef").is_ok());
        assert!(validate_session_id("session_0123456789ABCDEF").is_err());
        assert!(validate_session_id("session_123").is_err());
        assert!(validate_session_id("sess_0123456789abcdef").is_err());
    }

    #[test]
    fn agent_id_format() {
        assert!(validate_agent_id("claude-agent_01").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id(&"a".repeat(65)).is_err());
        assert!(validate_agent_id("has space").is_err());
    }

    #[test]
    fn memory_key_charset() {
        assert!(validate_memory_key("plan.step-1").is_ok());
        assert!(validate_memory_key("a/b").is_err());
        assert!(validate_memory_key("").is_err());
        assert!(validate_memory_key(&"k".repeat(256)).is_err());
    }
}
