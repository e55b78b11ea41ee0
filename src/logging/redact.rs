//! Secret redaction for log records (spec §4.1).
//!
//! Values following a key matching (case-insensitively) `api_key`, `token`,
//! `password`, or `secret` — separated from the key by `=`, `:`, or
//! whitespace — are replaced with the literal `[REDACTED]`. Applied to
//! `message` and recursively to `metadata`/`context` JSON values.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const REDACTED: &str = "[REDACTED]";

static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn patterns() -> &'static Vec<Regex> {
    PATTERNS.get_or_init(|| {
        const KEYS: &[&str] = &["api_key", "token", "password", "secret"];
        KEYS.iter()
            .map(|k| {
                Regex::new(&format!(
                    r"(?i)({key})(\s*[=:]\s*|\s+)(\S+)",
                    key = regex::escape(k)
                ))
                .expect("static redaction pattern is valid")
            })
            .collect()
    })
}

/// Redacts secret-like substrings in a plain string.
pub fn redact_str(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in patterns().iter() {
        out = pattern
            .replace_all(&out, |caps: &regex::Captures| {
                format!("{}{}{}", &caps[1], &caps[2], REDACTED)
            })
            .into_owned();
    }
    out
}

/// Recursively redacts string values inside a JSON value, including map
/// keys that themselves look like secret fields (their value is replaced
/// wholesale rather than pattern-matched, since there's no `key=value`
/// shape to find inside an already-split JSON field).
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_str(s)),
        Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_secret_key(k) {
                    redacted.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    redacted.insert(k.clone(), redact_value(v));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["api_key", "token", "password", "secret"]
        .iter()
        .any(|k| lower == *k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_equals_colon_and_whitespace_separators() {
        assert_eq!(redact_str("api_key=sk-abc"), "api_key=[REDACTED]");
        assert_eq!(redact_str("token: abc123"), "token: [REDACTED]");
        assert_eq!(redact_str("password hunter2"), "password [REDACTED]");
    }

    #[test]
    fn is_case_insensitive_on_the_key() {
        assert_eq!(redact_str("API_KEY=xyz"), "API_KEY=[REDACTED]");
        assert_eq!(redact_str("Secret: xyz"), "Secret: [REDACTED]");
    }

    #[test]
    fn leaves_unrelated_text_alone() {
        assert_eq!(redact_str("hello world"), "hello world");
    }

    #[test]
    fn redaction_is_idempotent() {
        let once = redact_str("api_key=sk-abc");
        let twice = redact_str(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn redacts_nested_json_values_and_keys() {
        let value = serde_json::json!({
            "outer": {
                "token": "abc123",
                "note": "password: hunter2",
            },
            "list": ["password=1234", "fine"]
        });
        let redacted = redact_value(&value);
        assert_eq!(redacted["outer"]["token"], "[REDACTED]");
        assert_eq!(redacted["outer"]["note"], "password: [REDACTED]");
        assert_eq!(redacted["list"][0], "password=[REDACTED]");
        assert_eq!(redacted["list"][1], "fine");
    }
}
