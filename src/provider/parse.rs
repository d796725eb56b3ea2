//! Reply parsing for model output.
//!
//! Plain-text mode asks the model to answer with a JSON envelope via prose,
//! and models routinely wrap it in markdown fences or leave raw control
//! characters inside string values. The helpers here extract and repair such
//! output before giving up.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use super::ProviderError;
use crate::task::ResponseFormat;

/// The reply envelope every adapter call must produce.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelReply {
    pub title: String,
    pub explanation: String,
    pub answer: serde_json::Value,
}

/// Returns the contents of the first fenced JSON block, if any.
///
/// When a response contains multiple fenced blocks, the first one wins; later
/// blocks are ignored. This mirrors the long-standing behavior of the
/// evaluation contract and is intentional, not an oversight.
pub fn extract_json_block(text: &str) -> Option<&str> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence pattern is valid")
    });
    fence
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Escapes raw newline, carriage-return and tab characters that appear
/// inside JSON string literals, leaving the structure untouched.
pub fn repair_json(raw: &str) -> String {
    let mut repaired = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in raw.chars() {
        if in_string {
            if escaped {
                repaired.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    repaired.push(c);
                    escaped = true;
                }
                '"' => {
                    repaired.push(c);
                    in_string = false;
                }
                '\n' => repaired.push_str("\\n"),
                '\r' => repaired.push_str("\\r"),
                '\t' => repaired.push_str("\\t"),
                other => repaired.push(other),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            repaired.push(c);
        }
    }

    repaired
}

/// Parses final model content into the reply envelope.
///
/// Schema mode expects clean JSON (the service's structured-output directive
/// guarantees it). Text mode additionally tries the first fenced block and
/// the string-literal repair before failing with `UnmarshalResponse`.
pub fn parse_reply(
    content: &str,
    format: &ResponseFormat,
    stop_reason: Option<String>,
) -> Result<ModelReply, ProviderError> {
    let trimmed = content.trim();

    let attempt = |text: &str| serde_json::from_str::<ModelReply>(text);

    let parsed = match format {
        ResponseFormat::Schema(_) => attempt(trimmed).map_err(Some),
        ResponseFormat::Text(_) => attempt(trimmed)
            .or_else(|_| match extract_json_block(trimmed) {
                Some(block) => attempt(block),
                None => attempt(trimmed),
            })
            .or_else(|_| attempt(&repair_json(trimmed)))
            .or_else(|e| match extract_json_block(trimmed) {
                Some(block) => attempt(&repair_json(block)),
                None => Err(e),
            })
            .map_err(Some),
    };

    parsed.map_err(|cause: Option<serde_json::Error>| ProviderError::UnmarshalResponse {
        reason: cause
            .map(|e| e.to_string())
            .unwrap_or_else(|| "invalid reply".to_string()),
        raw: content.to_string(),
        stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: ResponseFormat = ResponseFormat::Text(String::new());

    #[test]
    fn parses_clean_envelope() {
        let reply = parse_reply(
            r#"{"title": "T", "explanation": "E", "answer": "42"}"#,
            &TEXT,
            None,
        )
        .unwrap();
        assert_eq!(reply.title, "T");
        assert_eq!(reply.answer, serde_json::json!("42"));
    }

    #[test]
    fn parses_fenced_envelope() {
        let content = "Here you go:\n```json\n{\"title\": \"T\", \"explanation\": \"E\", \"answer\": \"ok\"}\n```\nDone.";
        let reply = parse_reply(content, &TEXT, None).unwrap();
        assert_eq!(reply.answer, serde_json::json!("ok"));
    }

    #[test]
    fn first_fenced_block_wins() {
        let content = "```json\n{\"title\": \"first\", \"explanation\": \"e\", \"answer\": \"a\"}\n```\n\
                       ```json\n{\"title\": \"second\", \"explanation\": \"e\", \"answer\": \"b\"}\n```";
        let reply = parse_reply(content, &TEXT, None).unwrap();
        assert_eq!(reply.title, "first");
    }

    #[test]
    fn repairs_raw_newlines_inside_strings() {
        let content = "{\"title\": \"T\", \"explanation\": \"line one\nline two\", \"answer\": \"x\ty\"}";
        let reply = parse_reply(content, &TEXT, None).unwrap();
        assert_eq!(reply.explanation, "line one\nline two");
        assert_eq!(reply.answer, serde_json::json!("x\ty"));
    }

    #[test]
    fn repair_leaves_valid_json_unchanged() {
        let valid = r#"{"a": "already\nescaped", "b": [1, 2]}"#;
        assert_eq!(repair_json(valid), valid);
    }

    #[test]
    fn repair_ignores_whitespace_outside_strings() {
        let spread = "{\n  \"a\": 1\n}";
        assert_eq!(repair_json(spread), spread);
    }

    #[test]
    fn unparseable_content_carries_raw_and_stop_reason() {
        let err = parse_reply("no json here", &TEXT, Some("length".into())).unwrap_err();
        match err {
            ProviderError::UnmarshalResponse {
                raw, stop_reason, ..
            } => {
                assert_eq!(raw, "no json here");
                assert_eq!(stop_reason.as_deref(), Some("length"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn schema_mode_does_not_attempt_repair() {
        let fenced = "```json\n{\"title\": \"T\", \"explanation\": \"E\", \"answer\": {}}\n```";
        let schema = ResponseFormat::Schema(serde_json::json!({"type": "object"}));
        assert!(parse_reply(fenced, &schema, None).is_err());
    }
}
