//! Canonicalizing exact-match validation.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ValidationRules, Validator, Verdict};
use crate::provider::{ProviderResponse, Usage};
use crate::task::{AnswerPayload, Task};

/// Canonical comparison form of a text answer.
///
/// Steps, in order: trim surrounding whitespace; delete all whitespace
/// (`ignore_whitespace`) or trim each line (`trim_lines`); lowercase unless
/// `case_sensitive`.
pub fn canonical_text(rules: &ValidationRules, value: &str) -> String {
    let mut canonical = value.trim().to_string();

    if rules.ignore_whitespace {
        canonical.retain(|c| !c.is_whitespace());
    } else if rules.trim_lines {
        canonical = canonical
            .split('\n')
            .map(|line| line.trim_end_matches('\r').trim())
            .collect::<Vec<_>>()
            .join("\n");
    }

    if !rules.case_sensitive {
        canonical = canonical.to_lowercase();
    }

    canonical
}

/// Canonical JSON form of a structured answer: keys sorted, no insignificant
/// whitespace, numbers compared by value.
pub fn canonical_json(value: &serde_json::Value) -> String {
    normalize(value).to_string()
}

fn normalize(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Number(n) => {
            // Integer-valued floats collapse onto their integer form so that
            // 2.0 and 2 compare equal.
            if let Some(f) = n.as_f64()
                && f.fract() == 0.0
                && f.abs() < i64::MAX as f64
            {
                return Value::Number((f as i64).into());
            }
            value.clone()
        }
        // Keys are sorted explicitly so the canonical form does not depend
        // on the map backing serde_json was built with.
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        _ => value.clone(),
    }
}

/// Validator that compares canonical forms for equality.
pub struct ExactValidator;

#[async_trait]
impl Validator for ExactValidator {
    fn name(&self) -> &str {
        "exact"
    }

    fn canonical(&self, rules: &ValidationRules, value: &AnswerPayload) -> String {
        match value {
            AnswerPayload::Text(text) => canonical_text(rules, text),
            AnswerPayload::Structured(json) => canonical_json(json),
        }
    }

    async fn is_correct(
        &self,
        _cancel: &CancellationToken,
        rules: &ValidationRules,
        expected: &[AnswerPayload],
        response: &ProviderResponse,
        _task: &Task,
    ) -> Result<Verdict> {
        let candidate = self.canonical(rules, &response.answer);
        let is_correct = expected
            .iter()
            .any(|value| self.canonical(rules, value) == candidate);

        Ok(Verdict {
            is_correct,
            title: "Exact Match".to_string(),
            explanation: if is_correct {
                "answer matches an accepted result".to_string()
            } else {
                "answer does not match any accepted result".to_string()
            },
            usage: Usage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(case_sensitive: bool, ignore_whitespace: bool, trim_lines: bool) -> ValidationRules {
        ValidationRules {
            case_sensitive,
            ignore_whitespace,
            trim_lines,
            judge: None,
        }
    }

    #[test]
    fn default_rules_trim_and_lowercase() {
        let r = ValidationRules::default();
        assert_eq!(canonical_text(&r, "  Hello World \n"), "hello world");
    }

    #[test]
    fn case_sensitive_preserves_case() {
        let r = rules(true, false, false);
        assert_eq!(canonical_text(&r, " Hello "), "Hello");
    }

    #[test]
    fn ignore_whitespace_deletes_all_whitespace() {
        let r = rules(false, true, false);
        assert_eq!(canonical_text(&r, "a b\nc\td"), "abcd");
    }

    #[test]
    fn trim_lines_normalizes_line_endings() {
        let r = rules(false, false, true);
        assert_eq!(canonical_text(&r, "  a \r\n  b  \n c"), "a\nb\nc");
    }

    #[test]
    fn ignore_whitespace_wins_over_trim_lines() {
        let r = rules(false, true, true);
        assert_eq!(canonical_text(&r, "a \n b"), "ab");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let variants = [
            rules(false, false, false),
            rules(true, false, false),
            rules(false, true, false),
            rules(false, false, true),
            rules(true, true, true),
        ];
        let inputs = ["  MiXed Case \n", "a\r\n b\t c", "Ünïcode  Σtring"];
        for r in &variants {
            for input in inputs {
                let once = canonical_text(r, input);
                assert_eq!(canonical_text(r, &once), once, "rules: {}", r.summary());
            }
        }
    }

    #[test]
    fn canonical_json_sorts_keys_and_compares_numbers_by_value() {
        let a = serde_json::json!({"b": 2.0, "a": [1, {"y": 1, "x": 2}]});
        let b = serde_json::json!({"a": [1.0, {"x": 2, "y": 1}], "b": 2});
        assert_eq!(canonical_json(&a), canonical_json(&b));

        let c = serde_json::json!({"b": 2.5});
        assert_ne!(canonical_json(&a), canonical_json(&c));
    }

    #[tokio::test]
    async fn verdict_accepts_any_expected_value() {
        let validator = ExactValidator;
        let expected = vec![
            AnswerPayload::Text("Alpha".into()),
            AnswerPayload::Text("Beta".into()),
        ];
        let task = Task {
            name: "t".into(),
            prompt: "p".into(),
            response_format: crate::task::ResponseFormat::Text("word".into()),
            expected: expected.clone(),
            files: vec![],
            rules: None,
            tools: vec![],
            system_prompt: None,
        };

        let mut response = crate::provider::mock::response(AnswerPayload::Text("  beta ".into()));
        let verdict = validator
            .is_correct(
                &CancellationToken::new(),
                &ValidationRules::default(),
                &expected,
                &response,
                &task,
            )
            .await
            .unwrap();
        assert!(verdict.is_correct);
        assert_eq!(verdict.title, "Exact Match");

        response.answer = AnswerPayload::Text("gamma".into());
        let verdict = validator
            .is_correct(
                &CancellationToken::new(),
                &ValidationRules::default(),
                &expected,
                &response,
                &task,
            )
            .await
            .unwrap();
        assert!(!verdict.is_correct);
    }
}
