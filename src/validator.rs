//! Answer validation.
//!
//! A task's resolved [`ValidationRules`] select one of two validators: the
//! canonicalizing [`exact::ExactValidator`], or the LLM-backed
//! [`judge::JudgeValidator`] that asks a dedicated judge run for a verdict.
//! The [`ValidatorFactory`] owns the judge catalog and performs the
//! configuration checks the runner surfaces at pre-flight.

pub mod exact;
pub mod judge;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::provider::{ProviderResponse, Usage};
use crate::task::{AnswerPayload, ResponseFormat, Task};

pub use judge::{JudgeDefinition, JudgeVariant};

/// Flags steering answer canonicalization, plus the optional judge selector.
///
/// The defaults are deliberately forgiving: comparisons are case-insensitive
/// and surrounding whitespace never counts.
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    pub case_sensitive: bool,

    /// Delete all whitespace before comparing.
    pub ignore_whitespace: bool,

    /// Trim each line before comparing; ignored when `ignore_whitespace`.
    pub trim_lines: bool,

    pub judge: Option<JudgeSelector>,
}

impl ValidationRules {
    /// Applies a task override on top of these rules. Set fields shadow;
    /// unset fields inherit.
    pub fn merged(&self, overrides: Option<&RuleOverrides>) -> ValidationRules {
        let Some(o) = overrides else {
            return self.clone();
        };
        ValidationRules {
            case_sensitive: o.case_sensitive.unwrap_or(self.case_sensitive),
            ignore_whitespace: o.ignore_whitespace.unwrap_or(self.ignore_whitespace),
            trim_lines: o.trim_lines.unwrap_or(self.trim_lines),
            judge: o.judge.clone().or_else(|| self.judge.clone()),
        }
    }

    /// One-line rendering for judge prompts and logs.
    pub fn summary(&self) -> String {
        format!(
            "case-sensitive: {}; ignore-whitespace: {}; trim-lines: {}",
            self.case_sensitive, self.ignore_whitespace, self.trim_lines
        )
    }
}

/// Partial rules carried by a task; see [`ValidationRules::merged`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleOverrides {
    pub case_sensitive: Option<bool>,
    pub ignore_whitespace: Option<bool>,
    pub trim_lines: Option<bool>,
    pub judge: Option<JudgeSelector>,
}

/// Selects a judge (by name and run variant) for semantic validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSelector {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub name: String,
    pub variant: String,

    /// Replaces the judge's prompt template for this task only.
    pub prompt_override: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Outcome of validating one candidate answer.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub is_correct: bool,
    pub title: String,
    pub explanation: String,

    /// Tokens spent producing the verdict (zero for exact validation).
    pub usage: Usage,
}

/// Decides whether a candidate answer is correct.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    /// Canonical comparison form of a value under the given rules.
    /// Idempotent: canonicalizing a canonical form is a no-op.
    fn canonical(&self, rules: &ValidationRules, value: &AnswerPayload) -> String;

    async fn is_correct(
        &self,
        cancel: &CancellationToken,
        rules: &ValidationRules,
        expected: &[AnswerPayload],
        response: &ProviderResponse,
        task: &Task,
    ) -> Result<Verdict>;
}

/// Builds validators and owns the judge catalog.
pub struct ValidatorFactory {
    judges: HashMap<String, Arc<JudgeDefinition>>,
}

impl ValidatorFactory {
    pub fn new(judges: Vec<JudgeDefinition>) -> Self {
        Self {
            judges: judges
                .into_iter()
                .map(|j| (j.name.clone(), Arc::new(j)))
                .collect(),
        }
    }

    pub fn judge(&self, name: &str) -> Option<&Arc<JudgeDefinition>> {
        self.judges.get(name)
    }

    /// Resolves the validator for a task's rules and response format.
    pub fn resolve(
        &self,
        rules: &ValidationRules,
        format: &ResponseFormat,
    ) -> Result<Arc<dyn Validator>> {
        match &rules.judge {
            Some(selector) if selector.enabled => {
                let judge = self
                    .judges
                    .get(&selector.name)
                    .ok_or_else(|| anyhow::anyhow!("judge {:?} is not defined", selector.name))?;
                if judge.disabled {
                    bail!("judge {:?} is disabled", selector.name);
                }
                if !judge.variants.contains_key(&selector.variant) {
                    bail!(
                        "judge {:?} has no run variant {:?}",
                        selector.name,
                        selector.variant
                    );
                }
                if format.is_structured() {
                    bail!("judge validation cannot be combined with a structured response format");
                }
                Ok(Arc::new(judge::JudgeValidator::new(
                    Arc::clone(judge),
                    selector.clone(),
                )))
            }
            _ => Ok(Arc::new(exact::ExactValidator)),
        }
    }

    /// Configuration errors for one task's validation setup, collected for
    /// the pre-flight report. Empty means the task is runnable.
    pub fn preflight(&self, rules: &ValidationRules, format: &ResponseFormat) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(selector) = &rules.judge else {
            return errors;
        };
        if !selector.enabled {
            return errors;
        }

        let Some(judge) = self.judges.get(&selector.name) else {
            errors.push(format!("judge {:?} is not defined", selector.name));
            return errors;
        };
        if judge.disabled {
            errors.push(format!("judge {:?} is disabled", selector.name));
        }
        if !judge.variants.contains_key(&selector.variant) {
            errors.push(format!(
                "judge {:?} has no run variant {:?}",
                selector.name, selector.variant
            ));
        }
        if format.is_structured() {
            errors.push(
                "judge validation cannot be combined with a structured response format"
                    .to_string(),
            );
        }
        errors.extend(judge.configuration_errors());
        errors
    }

    /// Releases every judge's provider adapter.
    pub async fn close(&self) {
        for judge in self.judges.values() {
            judge.close().await;
        }
    }
}
