//! Task definitions and attached-file handling.
//!
//! A [`Task`] is one evaluation unit: a prompt, a response format, and the
//! set of accepted answers. Tasks are resolved once (from configuration or
//! constructed directly) and are immutable afterwards; the runner shares them
//! across provider workers behind `Arc`.
//!
//! Attached files ([`FileReference`]) resolve their content lazily: the first
//! caller pays for the disk read or HTTP fetch, every later caller (including
//! concurrent ones on other provider workers) gets the memoized bytes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::validator::RuleOverrides;

/// Hard ceiling on fetching one remote attachment.
const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// How the model is asked to shape its answer.
///
/// Either a plain-text formatting instruction that is folded into the prompt,
/// or a JSON Schema the answer must conform to (sent as a native structured
/// output directive where the service supports one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Free-form answer with a formatting instruction.
    Text(String),

    /// Structured answer conforming to a JSON Schema.
    Schema(serde_json::Value),
}

impl ResponseFormat {
    /// Returns `true` for the structured-schema variant.
    pub fn is_structured(&self) -> bool {
        matches!(self, ResponseFormat::Schema(_))
    }
}

/// A candidate or expected answer.
///
/// Carries the same shape as the task's [`ResponseFormat`]: plain text for
/// `Text` formats, a JSON value for `Schema` formats.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerPayload {
    Text(String),
    Structured(serde_json::Value),
}

impl AnswerPayload {
    /// Builds a payload of the shape the given format expects.
    ///
    /// Strings become [`AnswerPayload::Text`] under a text format; everything
    /// else must pair with a schema format.
    pub fn for_format(value: serde_json::Value, format: &ResponseFormat) -> Result<Self> {
        match (format, value) {
            (ResponseFormat::Text(_), serde_json::Value::String(s)) => Ok(AnswerPayload::Text(s)),
            (ResponseFormat::Text(_), other) => {
                bail!("text-format answer must be a string, got: {other}")
            }
            (ResponseFormat::Schema(_), value) => Ok(AnswerPayload::Structured(value)),
        }
    }

    /// The raw text of a [`AnswerPayload::Text`] value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AnswerPayload::Text(s) => Some(s),
            AnswerPayload::Structured(_) => None,
        }
    }

    /// Renders the payload for inclusion in a prompt or log line.
    pub fn display(&self) -> String {
        match self {
            AnswerPayload::Text(s) => s.clone(),
            AnswerPayload::Structured(v) => v.to_string(),
        }
    }
}

/// Per-task selection of a catalog tool, with optional limit overrides.
///
/// Unset limits fall back to the tool definition's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelection {
    /// Name of a tool in the catalog.
    pub tool: String,

    /// Disabled selections are ignored by the runner.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum invocations of this tool within one task execution.
    pub max_calls: Option<u32>,

    /// Wall-clock ceiling per invocation, in seconds.
    pub per_call_timeout_secs: Option<u64>,

    /// Container memory cap, in megabytes.
    pub max_memory_mb: Option<u64>,

    /// Container CPU cap, as a percentage of one core.
    pub cpu_percent: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// One evaluation unit.
///
/// Produces one result per (provider, run) pair. Immutable after resolution;
/// `name` is unique within a batch.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub prompt: String,
    pub response_format: ResponseFormat,

    /// Accepted answers; every element has the shape of `response_format`.
    pub expected: Vec<AnswerPayload>,

    /// Attached files, unique by `name` within the task.
    pub files: Vec<std::sync::Arc<FileReference>>,

    /// Validation-rule overrides; unset fields inherit the batch default.
    pub rules: Option<RuleOverrides>,

    /// Tools the model may invoke while answering this task.
    pub tools: Vec<ToolSelection>,

    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

impl Task {
    /// Returns `true` if at least one enabled tool selection exists.
    pub fn uses_tools(&self) -> bool {
        self.tools.iter().any(|t| t.enabled)
    }

    /// Names of the enabled tool selections, in declaration order.
    pub fn enabled_tools(&self) -> impl Iterator<Item = &ToolSelection> {
        self.tools.iter().filter(|t| t.enabled)
    }
}

/// A lazily-loaded task attachment.
///
/// The URI is either local (absolute, or relative to the base directory the
/// reference was created with) or remote (`http`/`https`). Content, and the
/// base64 data URL derived from it, are computed at most once per batch even
/// when several provider workers race on the same file.
#[derive(Debug)]
pub struct FileReference {
    /// Filename the model (and the sandbox auxiliary dir) sees.
    pub name: String,

    uri: String,
    declared_mime: Option<String>,
    base_dir: Option<PathBuf>,
    content: OnceCell<Vec<u8>>,
}

impl FileReference {
    pub fn new(
        name: impl Into<String>,
        uri: impl Into<String>,
        declared_mime: Option<String>,
        base_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            declared_mime,
            base_dir,
            content: OnceCell::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Declared MIME type, or one inferred from the file name.
    pub fn mime_type(&self) -> String {
        self.declared_mime.clone().unwrap_or_else(|| {
            mime_guess::from_path(&self.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
    }

    /// The file bytes, fetched on first use and memoized.
    pub async fn content(&self) -> Result<&[u8]> {
        let bytes = self
            .content
            .get_or_try_init(|| self.fetch())
            .await
            .with_context(|| format!("failed to load file {:?} from {}", self.name, self.uri))?;
        Ok(bytes.as_slice())
    }

    /// The file content as a `data:` URL suitable for inline attachment.
    pub async fn data_url(&self) -> Result<String> {
        let bytes = self.content().await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{};base64,{}", self.mime_type(), encoded))
    }

    fn is_remote(&self) -> bool {
        self.uri.starts_with("http://") || self.uri.starts_with("https://")
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        if self.is_remote() {
            let client = reqwest::Client::builder()
                .timeout(REMOTE_FETCH_TIMEOUT)
                .build()?;
            let response = client.get(&self.uri).send().await?.error_for_status()?;
            Ok(response.bytes().await?.to_vec())
        } else {
            let path = PathBuf::from(&self.uri);
            let path = if path.is_absolute() {
                path
            } else {
                match &self.base_dir {
                    Some(base) => base.join(path),
                    None => path,
                }
            };
            Ok(tokio::fs::read(&path).await?)
        }
    }
}
