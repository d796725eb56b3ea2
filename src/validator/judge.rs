//! LLM-judge validation.
//!
//! A judge is a dedicated provider run that semantically verdicts a
//! candidate answer. Judges are configured separately from task providers
//! and cannot themselves select judge validation, so the provider recursion
//! is exactly one level deep.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::exact::{canonical_json, canonical_text};
use super::{JudgeSelector, ValidationRules, Validator, Verdict};
use crate::executor::RunExecutor;
use crate::provider::{CallContext, ProviderAdapter, ProviderResponse, RunConfig};
use crate::task::{AnswerPayload, ResponseFormat, Task};

/// Prompt template used when a judge does not define its own.
///
/// Placeholders: `{{task_prompt}}`, `{{answer_format}}`,
/// `{{expected_results}}`, `{{candidate_response}}`, `{{rules}}`.
pub const DEFAULT_JUDGE_TEMPLATE: &str = "\
You are grading a candidate answer against a set of accepted answers.

Original task:
{{task_prompt}}

Required answer format:
{{answer_format}}

Accepted answers (any one of these is correct):
{{expected_results}}

Candidate answer:
{{candidate_response}}

Comparison rules: {{rules}}

Decide whether the candidate answer is semantically equivalent to at least \
one accepted answer.";

const DEFAULT_VERDICT_INSTRUCTION: &str = "Reply with exactly PASS or FAIL.";

/// One judge run variant: an adapter plus the run configuration and its own
/// per-run executor (the variant's rate limiter is shared across every
/// verdict it produces).
pub struct JudgeVariant {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub run: RunConfig,
    executor: RunExecutor,
}

impl JudgeVariant {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, run: RunConfig) -> Self {
        let executor = RunExecutor::new(&run);
        Self {
            adapter,
            run,
            executor,
        }
    }
}

/// A configured judge.
///
/// `template`, `verdict_format` and `passing_verdicts` are optional in the
/// configuration; a custom template requires the other two, which is checked
/// at pre-flight via [`JudgeDefinition::configuration_errors`].
pub struct JudgeDefinition {
    pub name: String,
    pub disabled: bool,
    pub template: Option<String>,
    pub verdict_format: Option<ResponseFormat>,
    pub passing_verdicts: Option<Vec<AnswerPayload>>,
    pub variants: HashMap<String, JudgeVariant>,
}

impl JudgeDefinition {
    pub fn effective_template(&self) -> &str {
        self.template.as_deref().unwrap_or(DEFAULT_JUDGE_TEMPLATE)
    }

    pub fn effective_verdict_format(&self) -> ResponseFormat {
        self.verdict_format
            .clone()
            .unwrap_or_else(|| ResponseFormat::Text(DEFAULT_VERDICT_INSTRUCTION.to_string()))
    }

    pub fn effective_passing_verdicts(&self) -> Vec<AnswerPayload> {
        self.passing_verdicts
            .clone()
            .unwrap_or_else(|| vec![AnswerPayload::Text("PASS".to_string())])
    }

    /// Invariant checks surfaced during pre-flight.
    pub fn configuration_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.template.is_some() {
            if self.verdict_format.is_none() {
                errors.push(format!(
                    "judge {:?} supplies a custom template but no verdict format",
                    self.name
                ));
            }
            if self.passing_verdicts.is_none() {
                errors.push(format!(
                    "judge {:?} supplies a custom template but no passing verdicts",
                    self.name
                ));
            }
        }

        if let Some(ResponseFormat::Schema(schema)) = &self.verdict_format {
            match jsonschema::validator_for(schema) {
                Ok(compiled) => {
                    for (index, verdict) in self.effective_passing_verdicts().iter().enumerate() {
                        let value = match verdict {
                            AnswerPayload::Structured(v) => v.clone(),
                            AnswerPayload::Text(s) => serde_json::Value::String(s.clone()),
                        };
                        if !compiled.is_valid(&value) {
                            errors.push(format!(
                                "judge {:?}: passing verdict #{} does not conform to the verdict schema",
                                self.name,
                                index + 1
                            ));
                        }
                    }
                }
                Err(e) => {
                    errors.push(format!("judge {:?}: invalid verdict schema: {e}", self.name));
                }
            }
        }

        errors
    }

    pub async fn close(&self) {
        for variant in self.variants.values() {
            if let Err(e) = variant.adapter.close().await {
                warn!(judge = %self.name, error = %e, "failed to close judge adapter");
            }
        }
    }
}

/// Validator that delegates the verdict to a judge run.
pub struct JudgeValidator {
    judge: Arc<JudgeDefinition>,
    selector: JudgeSelector,
}

impl JudgeValidator {
    pub fn new(judge: Arc<JudgeDefinition>, selector: JudgeSelector) -> Self {
        Self { judge, selector }
    }

    fn render_prompt(
        &self,
        rules: &ValidationRules,
        expected: &[AnswerPayload],
        response: &ProviderResponse,
        task: &Task,
    ) -> String {
        let template = self
            .selector
            .prompt_override
            .as_deref()
            .unwrap_or_else(|| self.judge.effective_template());

        let answer_format = match &task.response_format {
            ResponseFormat::Text(instruction) => instruction.clone(),
            ResponseFormat::Schema(schema) => schema.to_string(),
        };
        let expected_results = expected
            .iter()
            .map(|value| format!("- {}", value.display()))
            .collect::<Vec<_>>()
            .join("\n");

        template
            .replace("{{task_prompt}}", &task.prompt)
            .replace("{{answer_format}}", &answer_format)
            .replace("{{expected_results}}", &expected_results)
            .replace("{{candidate_response}}", &response.answer.display())
            .replace("{{rules}}", &rules.summary())
    }
}

#[async_trait]
impl Validator for JudgeValidator {
    fn name(&self) -> &str {
        "judge"
    }

    fn canonical(&self, rules: &ValidationRules, value: &AnswerPayload) -> String {
        match value {
            AnswerPayload::Text(text) => canonical_text(rules, text),
            AnswerPayload::Structured(json) => canonical_json(json),
        }
    }

    async fn is_correct(
        &self,
        cancel: &CancellationToken,
        rules: &ValidationRules,
        expected: &[AnswerPayload],
        response: &ProviderResponse,
        task: &Task,
    ) -> Result<Verdict> {
        let variant = self
            .judge
            .variants
            .get(&self.selector.variant)
            .with_context(|| {
                format!(
                    "judge {:?} has no run variant {:?}",
                    self.judge.name, self.selector.variant
                )
            })?;

        let passing = self.judge.effective_passing_verdicts();

        // The verdict task has no judge rules and no tools, so the provider
        // recursion stops here.
        let judge_task = Task {
            name: format!("judge:{}", task.name),
            prompt: self.render_prompt(rules, expected, response, task),
            response_format: self.judge.effective_verdict_format(),
            expected: passing.clone(),
            files: Vec::new(),
            rules: None,
            tools: Vec::new(),
            system_prompt: None,
        };

        let cx = CallContext::new(cancel.clone());
        let judged = variant
            .executor
            .execute(
                cancel,
                |_| variant.adapter.run(&cx, &variant.run, &judge_task),
                |_, _| {},
            )
            .await
            .with_context(|| format!("judge {:?} failed to produce a verdict", self.judge.name))?;

        // Verdict matching is a configuration-level comparison; the task's
        // own rules do not apply here.
        let verdict_rules = ValidationRules::default();
        let candidate = self.canonical(&verdict_rules, &judged.answer);
        let is_correct = passing
            .iter()
            .any(|value| self.canonical(&verdict_rules, value) == candidate);

        Ok(Verdict {
            is_correct,
            title: "Semantic Assessment".to_string(),
            explanation: judged.explanation,
            usage: judged.usage,
        })
    }
}
