//! Configuration schema.
//!
//! Two documents drive a batch:
//!
//! ```text
//! config.yaml                         tasks.yaml
//! ├── providers: [...]                └── tasks:
//! │   ├── name, service, client           ├── name, prompt
//! │   └── runs: [...]                     ├── response_format: {text|schema}
//! ├── judges: [...]                       ├── expected: [...]
//! ├── tools: [...]                        ├── files, rules, tools
//! └── defaults.rules                      └── system_prompt
//! ```
//!
//! `service` is a tagged value selecting the adapter; OpenAI-compatible
//! vendors share one adapter and differ only in their default endpoint.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::provider::anthropic::AnthropicAdapter;
use crate::provider::google::GoogleAdapter;
use crate::provider::mock::MockProvider;
use crate::provider::openai::{
    ALIBABA_BASE_URL, DEEPSEEK_BASE_URL, MISTRAL_BASE_URL, MOONSHOT_BASE_URL, OpenAiAdapter,
    XAI_BASE_URL,
};
use crate::provider::{ClientParams, ModelParams, ProviderAdapter, RetryPolicy, RunConfig};
use crate::runner::{ProviderEntry, Runner};
use crate::sandbox::{SandboxDriver, ToolDefinition, ToolExecutor};
use crate::task::{AnswerPayload, FileReference, ResponseFormat, Task, ToolSelection};
use crate::validator::judge::{JudgeDefinition, JudgeVariant};
use crate::validator::{RuleOverrides, ValidationRules, ValidatorFactory};

/// Root of `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub providers: Vec<ProviderSpec>,

    #[serde(default)]
    pub judges: Vec<JudgeSpec>,

    #[serde(default)]
    pub tools: Vec<ToolDefinition>,

    #[serde(default)]
    pub defaults: Defaults,
}

/// Batch-wide defaults; task rules override-merge on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub rules: RuleOverrides,
}

/// One remote provider and its ordered run variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub service: ServiceKind,

    #[serde(default)]
    pub client: ClientConfig,

    pub runs: Vec<RunSpec>,
}

/// Which adapter (and default endpoint) a provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Openai,
    Anthropic,
    Google,
    Deepseek,
    Mistral,
    Xai,
    Alibaba,
    Moonshot,
    /// In-process echo adapter; answers with the task's first expected
    /// result. Useful for smoke-testing configurations offline.
    Mock,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Inline API key; prefer `api_key_env` outside throwaway setups.
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,

    pub base_url: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub name: String,
    pub model: String,

    /// Requests per minute; 0 disables throttling.
    #[serde(default)]
    pub max_rpm: u32,

    pub retry: Option<RetrySpec>,

    #[serde(default)]
    pub params: ParamsSpec,
}

impl RunSpec {
    fn to_run_config(&self) -> RunConfig {
        RunConfig {
            name: self.name.clone(),
            model: self.model.clone(),
            max_rpm: self.max_rpm,
            retry: self.retry.as_ref().map(|r| RetryPolicy {
                max_attempts: r.max_attempts,
                initial_delay: Duration::from_millis(r.initial_delay_ms),
            }),
            params: ModelParams {
                temperature: self.params.temperature,
                top_p: self.params.top_p,
                max_tokens: self.params.max_tokens,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamsSpec {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// One judge definition; see the judge validator for the template contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSpec {
    pub name: String,

    #[serde(default)]
    pub disabled: bool,

    pub template: Option<String>,
    pub verdict_format: Option<ResponseFormat>,
    pub passing_verdicts: Option<Vec<serde_json::Value>>,

    pub variants: Vec<JudgeVariantSpec>,
}

/// One judge run variant: a dedicated provider client plus run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVariantSpec {
    pub name: String,
    pub service: ServiceKind,

    #[serde(default)]
    pub client: ClientConfig,

    pub model: String,

    #[serde(default)]
    pub max_rpm: u32,

    pub retry: Option<RetrySpec>,

    #[serde(default)]
    pub params: ParamsSpec,
}

impl Config {
    /// Structural checks: unique names everywhere, no empty run lists.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        check_unique(
            self.providers.iter().map(|p| p.name.as_str()),
            "provider",
            &mut errors,
        );
        check_unique(self.judges.iter().map(|j| j.name.as_str()), "judge", &mut errors);
        check_unique(self.tools.iter().map(|t| t.name.as_str()), "tool", &mut errors);

        for provider in &self.providers {
            if provider.runs.is_empty() {
                errors.push(format!("provider {:?} has no runs", provider.name));
            }
            check_unique(
                provider.runs.iter().map(|r| r.name.as_str()),
                &format!("run of provider {:?}", provider.name),
                &mut errors,
            );
        }
        for judge in &self.judges {
            if judge.variants.is_empty() {
                errors.push(format!("judge {:?} has no variants", judge.name));
            }
            check_unique(
                judge.variants.iter().map(|v| v.name.as_str()),
                &format!("variant of judge {:?}", judge.name),
                &mut errors,
            );
        }

        if !errors.is_empty() {
            bail!("invalid configuration:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    /// Builds the runner: adapters, judges, the tool catalog, and default
    /// rules. `driver` is required iff tools are configured.
    pub fn build_runner(&self, driver: Option<Arc<dyn SandboxDriver>>) -> Result<Runner> {
        self.validate()?;

        let mut providers = Vec::new();
        for spec in &self.providers {
            let adapter = build_adapter(&spec.name, spec.service, &spec.client)
                .with_context(|| format!("provider {:?}", spec.name))?;
            providers.push(ProviderEntry {
                name: spec.name.clone(),
                adapter,
                runs: spec.runs.iter().map(RunSpec::to_run_config).collect(),
            });
        }

        let mut judges = Vec::new();
        for spec in &self.judges {
            judges.push(build_judge(spec)?);
        }

        let tools = if self.tools.is_empty() {
            None
        } else {
            let driver = driver.context("tools are configured but no sandbox driver was given")?;
            let executor = ToolExecutor::new(driver);
            for tool in &self.tools {
                executor.register(tool.clone());
            }
            Some(executor)
        };

        let default_rules = ValidationRules::default().merged(Some(&self.defaults.rules));

        Ok(Runner::new(
            providers,
            ValidatorFactory::new(judges),
            tools,
            default_rules,
        ))
    }
}

fn check_unique<'a>(
    names: impl Iterator<Item = &'a str>,
    what: &str,
    errors: &mut Vec<String>,
) {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            errors.push(format!("duplicate {what} name {name:?}"));
        }
    }
}

fn build_adapter(
    name: &str,
    service: ServiceKind,
    client: &ClientConfig,
) -> Result<Arc<dyn ProviderAdapter>> {
    if service == ServiceKind::Mock {
        return Ok(Arc::new(MockProvider::echo(name)));
    }

    let api_key = match (&client.api_key, &client.api_key_env) {
        (Some(key), _) => key.clone(),
        (None, Some(var)) => std::env::var(var)
            .with_context(|| format!("api key environment variable {var:?} is not set"))?,
        (None, None) => bail!("no api_key or api_key_env configured"),
    };
    let params = ClientParams {
        api_key,
        base_url: client.base_url.clone(),
        request_timeout: Duration::from_secs(client.request_timeout_secs),
    };

    let adapter: Arc<dyn ProviderAdapter> = match service {
        ServiceKind::Openai => Arc::new(OpenAiAdapter::new(name, params)?),
        ServiceKind::Deepseek => Arc::new(OpenAiAdapter::compatible(name, params, DEEPSEEK_BASE_URL)?),
        ServiceKind::Mistral => Arc::new(OpenAiAdapter::compatible(name, params, MISTRAL_BASE_URL)?),
        ServiceKind::Xai => Arc::new(OpenAiAdapter::compatible(name, params, XAI_BASE_URL)?),
        ServiceKind::Alibaba => Arc::new(OpenAiAdapter::compatible(name, params, ALIBABA_BASE_URL)?),
        ServiceKind::Moonshot => Arc::new(OpenAiAdapter::compatible(name, params, MOONSHOT_BASE_URL)?),
        ServiceKind::Anthropic => Arc::new(AnthropicAdapter::new(name, params)?),
        ServiceKind::Google => Arc::new(GoogleAdapter::new(name, params)?),
        ServiceKind::Mock => unreachable!("handled above"),
    };
    Ok(adapter)
}

fn build_judge(spec: &JudgeSpec) -> Result<JudgeDefinition> {
    let verdict_format = spec.verdict_format.clone();
    let effective_format = verdict_format
        .clone()
        .unwrap_or_else(|| ResponseFormat::Text(String::new()));

    let passing_verdicts = spec
        .passing_verdicts
        .as_ref()
        .map(|values| {
            values
                .iter()
                .cloned()
                .map(|value| AnswerPayload::for_format(value, &effective_format))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()
        .with_context(|| format!("judge {:?}: invalid passing verdicts", spec.name))?;

    let mut variants = HashMap::new();
    for variant in &spec.variants {
        let adapter = build_adapter(
            &format!("{}:{}", spec.name, variant.name),
            variant.service,
            &variant.client,
        )
        .with_context(|| format!("judge {:?} variant {:?}", spec.name, variant.name))?;
        let run = RunSpec {
            name: variant.name.clone(),
            model: variant.model.clone(),
            max_rpm: variant.max_rpm,
            retry: variant.retry.clone(),
            params: variant.params.clone(),
        }
        .to_run_config();
        variants.insert(variant.name.clone(), JudgeVariant::new(adapter, run));
    }

    Ok(JudgeDefinition {
        name: spec.name.clone(),
        disabled: spec.disabled,
        template: spec.template.clone(),
        verdict_format,
        passing_verdicts,
        variants,
    })
}

/// Root of `tasks.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub tasks: Vec<TaskSpec>,
}

impl TaskFile {
    /// Resolves every task; attachment URIs resolve against `base_dir`.
    pub fn resolve(&self, base_dir: Option<&Path>) -> Result<Vec<Arc<Task>>> {
        self.tasks
            .iter()
            .map(|spec| spec.resolve(base_dir).map(Arc::new))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub prompt: String,
    pub response_format: ResponseFormat,

    /// Accepted answers: strings for text formats, objects for schemas.
    pub expected: Vec<serde_json::Value>,

    #[serde(default)]
    pub files: Vec<FileSpec>,

    pub rules: Option<RuleOverrides>,

    #[serde(default)]
    pub tools: Vec<ToolSelection>,

    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    pub name: String,
    pub uri: String,
    pub mime: Option<String>,
}

impl TaskSpec {
    fn resolve(&self, base_dir: Option<&Path>) -> Result<Task> {
        let expected = self
            .expected
            .iter()
            .cloned()
            .map(|value| AnswerPayload::for_format(value, &self.response_format))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("task {:?}: invalid expected results", self.name))?;

        let mut file_names = std::collections::BTreeSet::new();
        let mut files = Vec::new();
        for file in &self.files {
            if !file_names.insert(file.name.as_str()) {
                bail!("task {:?}: duplicate file name {:?}", self.name, file.name);
            }
            files.push(Arc::new(FileReference::new(
                &file.name,
                &file.uri,
                file.mime.clone(),
                base_dir.map(Path::to_path_buf),
            )));
        }

        Ok(Task {
            name: self.name.clone(),
            prompt: self.prompt.clone(),
            response_format: self.response_format.clone(),
            expected,
            files,
            rules: self.rules.clone(),
            tools: self.tools.clone(),
            system_prompt: self.system_prompt.clone(),
        })
    }
}
