//! # mindtrial
//!
//! A parallel evaluation harness that runs user-defined prompt tasks against
//! one or more remote language-model providers and records, per
//! (task, provider, run-variant) triple, whether the model's answer matches
//! an accepted expected result.
//!
//! ## Overview
//!
//! - **Parallel across providers, serial within one**: each provider gets a
//!   dedicated worker; run variants and tasks execute in declaration order,
//!   so per-provider rate limits and run ordering always hold
//! - **Per-run policies**: token-bucket rate limiting and exponential-backoff
//!   retry for transient failures
//! - **Tool calling**: model-initiated tool calls run in isolated containers
//!   with resource caps, and their failures feed back into the conversation
//! - **Two validators**: canonicalizing exact match, or an LLM judge for
//!   semantic verdicts
//! - **Partial-failure semantics**: one task's error never takes down its
//!   siblings; cancellation keeps everything completed so far
//!
//! ## Architecture
//!
//! ### Runner ([`runner`])
//!
//! The scheduler and the result aggregator:
//!
//! - [`Runner`] - pre-flight checks, worker fan-out, sync/async entry points
//! - [`runner::results::ResultSet`] / [`runner::results::AsyncResultSet`] -
//!   completed results, streaming progress, cancellation
//!
//! ### Providers ([`provider`])
//!
//! One adapter per remote service, all driving the same conversation loop:
//!
//! - [`provider::openai::OpenAiAdapter`] - OpenAI and compatible vendors
//! - [`provider::anthropic::AnthropicAdapter`] - Anthropic-style services
//! - [`provider::google::GoogleAdapter`] - Google-style services
//! - [`provider::mock::MockProvider`] - scriptable in-process double
//!
//! ### Sandbox ([`sandbox`])
//!
//! Tool execution in throwaway containers behind the
//! [`sandbox::SandboxDriver`] trait; [`sandbox::docker::DockerDriver`] is the
//! bollard-backed implementation.
//!
//! ### Validation ([`validator`])
//!
//! [`validator::exact::ExactValidator`] compares canonical forms;
//! [`validator::judge::JudgeValidator`] asks a dedicated judge run.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//! use mindtrial::config::{load_config, load_tasks};
//! use mindtrial::report::print_summary;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("config.yaml"))?;
//!     let tasks = load_tasks(Path::new("tasks.yaml"))?;
//!
//!     let runner = config.build_runner(None)?;
//!     let results = runner.run(CancellationToken::new(), tasks).await?;
//!
//!     print_summary(&results);
//!     runner.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod executor;
pub mod provider;
pub mod report;
pub mod runner;
pub mod sandbox;
pub mod task;
pub mod validator;

// Re-export the types most embedders need.

pub use config::{Config, load_config, load_tasks};
pub use provider::{
    CallContext, ClientParams, ModelParams, ProviderAdapter, ProviderError, ProviderResponse,
    RetryPolicy, RunConfig, Usage,
};
pub use runner::results::{AsyncResultSet, ResultKind, ResultSet, TaskResult};
pub use runner::{ProviderEntry, Runner};
pub use sandbox::{SandboxDriver, ToolDefinition, ToolExecutor, ToolUsage};
pub use task::{AnswerPayload, FileReference, ResponseFormat, Task};
pub use validator::{ValidationRules, Validator, ValidatorFactory, Verdict};
