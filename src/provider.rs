//! Provider adapters for remote language-model services.
//!
//! An adapter translates `(run-config, task)` into one service request,
//! drives the tool-call conversation loop, classifies failures, and extracts
//! token usage. The wire formats differ per service; the conversation model
//! here is the common ground every adapter maps onto.
//!
//! # Architecture
//!
//! ```text
//! Runner ──► ProviderAdapter::run(cx, run, task)
//!                  │
//!                  ▼
//!          drive_conversation ◄──────────┐
//!                  │                      │ tool results
//!                  ▼                      │
//!          ChatBackend::complete ──► ToolSession::execute
//!            (one HTTP request)      (sandboxed container)
//! ```
//!
//! Concrete adapters implement [`ChatBackend`] (one request/response turn)
//! and delegate their [`ProviderAdapter::run`] to [`drive_conversation`],
//! which owns message history, the turn cap, and tool dispatch.
//!
//! # Error classification
//!
//! | Variant | Handling upstream |
//! |---------|-------------------|
//! | `Retryable` | consumed by the per-run retry loop |
//! | `FeatureNotSupported` | task reported as `NotSupported` |
//! | `UnmarshalResponse` | task reported as `Error` with raw content |
//! | anything else | task reported as `Error` |

pub mod anthropic;
pub mod google;
pub mod mock;
pub mod openai;
pub mod parse;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::sandbox::{SandboxError, ToolSession, ToolSpec, ToolUsage};
use crate::task::{AnswerPayload, ResponseFormat, Task};

/// Upper bound on request/tool-result round trips within one adapter call.
///
/// Per-tool `max_calls` budgets are the primary brake; this cap is the
/// backstop against a model that keeps requesting tools forever.
pub const MAX_CONVERSATION_TURNS: usize = 20;

/// Instruction used when a task does not override the system prompt.
///
/// Plain-text tasks rely on it to get a parseable reply envelope; structured
/// tasks get the envelope from the service's native schema directive instead.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are solving an evaluation task. Reply with a single JSON object with \
exactly these fields: \"title\" (a short name for your answer), \
\"explanation\" (your reasoning, briefly), and \"answer\" (the answer itself, \
following the requested answer format exactly). Do not wrap the object in \
markdown fences and do not add any other text.";

/// Errors produced by provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transient service failure (HTTP 429/5xx or equivalent); the per-run
    /// executor may retry it.
    #[error("transient provider error: {0}")]
    Retryable(String),

    /// The service rejects a capability the task requires (attachments,
    /// structured output, tools).
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// The model's final content does not satisfy the reply contract.
    #[error("failed to parse model response: {reason}")]
    UnmarshalResponse {
        reason: String,
        /// Raw content as returned by the service.
        raw: String,
        /// Service-reported stop reason, when available.
        stop_reason: Option<String>,
    },

    /// Non-transient API failure.
    #[error("API error (status {status}): {body}")]
    ApiResponse { status: u16, body: String },

    /// The run configuration carries parameters the service rejects.
    #[error("invalid model parameters: {0}")]
    InvalidModelParams(String),

    /// A task attachment cannot be delivered to this service.
    #[error("file not supported: {0}")]
    FileNotSupported(String),

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The request exceeded the client timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Failure raised by the sandbox while executing a tool call.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Only these errors consume retry attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }
}

/// Maps an HTTP error status to the matching error kind.
pub fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        429 | 500 | 502 | 503 => ProviderError::Retryable(format!("HTTP {status}: {body}")),
        _ => ProviderError::ApiResponse { status, body },
    }
}

/// Maps a transport failure to the matching error kind.
pub fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_connect() {
        ProviderError::Retryable(format!("connection error: {err}"))
    } else {
        ProviderError::Network(err)
    }
}

/// Connection parameters shared by every run of one provider.
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub api_key: String,

    /// Overrides the service's default endpoint; this is how one adapter
    /// serves several OpenAI-compatible vendors.
    pub base_url: Option<String>,

    /// Per-request timeout applied by the HTTP client.
    pub request_timeout: Duration,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Sampling and budget parameters forwarded to the model.
#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Retry policy of one run: exponential backoff starting at `initial_delay`,
/// doubling per retry, at most `max_attempts` retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

/// A named (model, parameters) pair under a provider. Runs of one provider
/// execute in declaration order.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub name: String,
    pub model: String,

    /// Requests-per-minute budget; `0` disables rate limiting.
    pub max_rpm: u32,

    pub retry: Option<RetryPolicy>,
    pub params: ModelParams,
}

/// Per-call context handed down from the runner.
#[derive(Clone)]
pub struct CallContext {
    pub cancel: CancellationToken,

    /// Present iff the task enables tools.
    pub tools: Option<ToolSession>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tools: None,
        }
    }

    pub fn with_tools(cancel: CancellationToken, tools: Option<ToolSession>) -> Self {
        Self { cancel, tools }
    }
}

/// Token and tool usage accumulated over one adapter call.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub tool_usage: HashMap<String, ToolUsage>,
}

impl Usage {
    /// Folds another request's token counts into this total.
    pub fn add_tokens(&mut self, input: Option<u64>, output: Option<u64>) {
        if let Some(n) = input {
            *self.input_tokens.get_or_insert(0) += n;
        }
        if let Some(n) = output {
            *self.output_tokens.get_or_insert(0) += n;
        }
    }

    pub fn merge(&mut self, other: &Usage) {
        self.add_tokens(other.input_tokens, other.output_tokens);
        for (tool, usage) in &other.tool_usage {
            self.tool_usage.entry(tool.clone()).or_default().merge(usage);
        }
    }
}

/// Message roles of the provider-neutral conversation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An inline file attachment, pre-encoded as a `data:` URL.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub data_url: String,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One message of the conversation history.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set on `Tool` messages: the id of the call being answered.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachments,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            attachments: Vec::new(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// What one request/response round trip produced.
#[derive(Debug, Clone)]
pub enum TurnOutput {
    /// The model is done; `content` is the final reply body.
    Final {
        content: String,
        stop_reason: Option<String>,
    },

    /// The model requested tool invocations before continuing.
    ToolCalls {
        calls: Vec<ToolCallRequest>,
        /// Any partial content preceding the calls.
        content: String,
    },
}

/// One completed turn, with the request's token counts.
#[derive(Debug, Clone)]
pub struct Turn {
    pub output: TurnOutput,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// One request/response exchange against a concrete service.
///
/// Implementations translate the neutral conversation model into the wire
/// format, send exactly one request, and translate the reply back.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        run: &RunConfig,
        messages: &[ChatMessage],
        format: &ResponseFormat,
        tools: &[ToolSpec],
    ) -> Result<Turn, ProviderError>;
}

/// The complete outcome of one adapter call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Short answer title supplied by the model.
    pub title: String,

    /// The model's reasoning.
    pub explanation: String,

    /// Final answer content in the task's format shape.
    pub answer: AnswerPayload,

    /// Prompts sent, in order, for the result record.
    pub prompts: Vec<String>,

    pub usage: Usage,
    pub duration: Duration,
}

/// A remote language-model service.
///
/// One instance per configured provider; the runner calls `run` once per
/// (run-variant, task) pair, strictly sequentially within the provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        cx: &CallContext,
        run: &RunConfig,
        task: &Task,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Releases client resources. Default: nothing to release.
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Wraps a task's answer schema in the reply envelope the adapters request
/// from services with native structured output.
pub fn reply_envelope_schema(answer_schema: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "explanation": {"type": "string"},
            "answer": answer_schema,
        },
        "required": ["title", "explanation", "answer"],
        "additionalProperties": false,
    })
}

/// System prompt for a task, honoring the task override and the format mode.
pub fn resolve_system_prompt(task: &Task) -> Option<String> {
    if let Some(prompt) = &task.system_prompt {
        return Some(prompt.clone());
    }
    match &task.response_format {
        ResponseFormat::Text(_) => Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        // The schema directive already shapes the reply.
        ResponseFormat::Schema(_) => None,
    }
}

fn render_user_prompt(task: &Task) -> String {
    match &task.response_format {
        ResponseFormat::Text(instruction) => {
            format!("{}\n\nAnswer format: {}", task.prompt, instruction)
        }
        ResponseFormat::Schema(_) => task.prompt.clone(),
    }
}

/// Runs the conversation loop for one adapter call.
///
/// Owns message history, the turn cap, tool dispatch, usage accumulation,
/// and final-reply parsing. Backends stay stateless.
pub async fn drive_conversation(
    backend: &dyn ChatBackend,
    cx: &CallContext,
    run: &RunConfig,
    task: &Task,
) -> Result<ProviderResponse, ProviderError> {
    let start = Instant::now();
    let mut messages = Vec::new();
    let mut prompts = Vec::new();

    if let Some(system) = resolve_system_prompt(task) {
        prompts.push(format!("system: {system}"));
        messages.push(ChatMessage::system(system));
    }

    let mut attachments = Vec::new();
    for file in &task.files {
        let data_url = file
            .data_url()
            .await
            .map_err(|e| ProviderError::FileNotSupported(format!("{}: {e:#}", file.name)))?;
        attachments.push(Attachment {
            name: file.name.clone(),
            mime: file.mime_type(),
            data_url,
        });
    }

    let user = render_user_prompt(task);
    prompts.push(format!("user: {user}"));
    messages.push(ChatMessage::user(user, attachments));

    let tool_specs: Vec<ToolSpec> = cx
        .tools
        .as_ref()
        .map(|session| session.specs().to_vec())
        .unwrap_or_default();

    let mut usage = Usage::default();

    for _ in 0..MAX_CONVERSATION_TURNS {
        if cx.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let turn = backend
            .complete(&cx.cancel, run, &messages, &task.response_format, &tool_specs)
            .await?;
        usage.add_tokens(turn.input_tokens, turn.output_tokens);

        match turn.output {
            TurnOutput::ToolCalls { calls, content } => {
                let session = cx.tools.as_ref().ok_or_else(|| {
                    ProviderError::Other(anyhow!(
                        "model requested tool calls but the task has no tools enabled"
                    ))
                })?;
                messages.push(ChatMessage::assistant(content, calls.clone()));
                for call in calls {
                    let result = session
                        .execute(&cx.cancel, &call.name, &call.arguments)
                        .await
                        .map_err(|e| match e {
                            SandboxError::Cancelled => ProviderError::Cancelled,
                            other => ProviderError::Sandbox(other),
                        })?;
                    messages.push(ChatMessage::tool_result(call.id, result));
                }
            }
            TurnOutput::Final {
                content,
                stop_reason,
            } => {
                let reply = parse::parse_reply(&content, &task.response_format, stop_reason)?;
                let answer = match &task.response_format {
                    ResponseFormat::Text(_) => AnswerPayload::Text(match reply.answer {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    }),
                    ResponseFormat::Schema(_) => AnswerPayload::Structured(reply.answer),
                };
                if let Some(session) = &cx.tools {
                    usage.tool_usage = session.usage();
                }
                return Ok(ProviderResponse {
                    title: reply.title,
                    explanation: reply.explanation,
                    answer,
                    prompts,
                    usage,
                    duration: start.elapsed(),
                });
            }
        }
    }

    Err(ProviderError::Other(anyhow!(
        "conversation exceeded {MAX_CONVERSATION_TURNS} turns without a final answer"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_task(system_prompt: Option<String>) -> Task {
        Task {
            name: "t".into(),
            prompt: "p".into(),
            response_format: ResponseFormat::Text("one word".into()),
            expected: vec![],
            files: vec![],
            rules: None,
            tools: vec![],
            system_prompt,
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(classify_status(429, "slow down".into()).is_retryable());
        assert!(classify_status(500, "oops".into()).is_retryable());
        assert!(classify_status(503, "overloaded".into()).is_retryable());
        assert!(!classify_status(400, "bad".into()).is_retryable());
        assert!(!classify_status(401, "no".into()).is_retryable());
    }

    #[test]
    fn envelope_wraps_answer_schema() {
        let schema = serde_json::json!({"type": "integer"});
        let envelope = reply_envelope_schema(&schema);
        assert_eq!(envelope["properties"]["answer"], schema);
        assert_eq!(envelope["required"][2], "answer");
    }

    #[test]
    fn system_prompt_follows_format_mode() {
        assert_eq!(
            resolve_system_prompt(&text_task(None)).as_deref(),
            Some(DEFAULT_SYSTEM_PROMPT)
        );

        let mut schema_task = text_task(None);
        schema_task.response_format = ResponseFormat::Schema(serde_json::json!({"type": "object"}));
        assert_eq!(resolve_system_prompt(&schema_task), None);

        let mut overridden = text_task(Some("custom".into()));
        overridden.response_format = ResponseFormat::Schema(serde_json::json!({"type": "object"}));
        assert_eq!(resolve_system_prompt(&overridden).as_deref(), Some("custom"));
    }

    #[test]
    fn usage_totals_accumulate() {
        let mut usage = Usage::default();
        usage.add_tokens(Some(10), None);
        usage.add_tokens(Some(5), Some(7));
        assert_eq!(usage.input_tokens, Some(15));
        assert_eq!(usage.output_tokens, Some(7));

        let mut other = Usage::default();
        other.add_tokens(Some(1), Some(1));
        other
            .tool_usage
            .insert("calc".into(), crate::sandbox::ToolUsage {
                calls: 2,
                total_duration: Duration::from_millis(30),
            });
        usage.merge(&other);
        assert_eq!(usage.input_tokens, Some(16));
        assert_eq!(usage.tool_usage["calc"].calls, 2);
    }
}
