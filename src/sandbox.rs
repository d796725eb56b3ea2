//! Sandboxed tool execution.
//!
//! Models invoke tools mid-conversation; every invocation runs in a fresh,
//! isolated container with declared resource caps. The concrete container
//! runtime sits behind the [`SandboxDriver`] trait (see [`docker`] for the
//! bollard implementation); the [`ToolExecutor`] on top of it owns the tool
//! catalog, per-task call accounting, mounted directories, and usage stats.
//!
//! # Failure semantics
//!
//! Setup problems (unknown tool image, unreachable daemon) are fatal for the
//! batch and surface from [`ToolExecutor::validate`] during pre-flight.
//! Per-call runtime problems (timeout, OOM kill, non-zero exit) are *not*
//! errors at this layer: they come back as formatted message bytes that the
//! provider adapter feeds to the model as the tool result, so the
//! conversation can recover.

pub mod docker;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::task::{FileReference, Task};

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised by the sandbox subsystem.
///
/// Only `ToolNotFound`, `Setup`, `Io` and `Cancelled` escape
/// [`ToolExecutor::execute`]; runtime failures are rendered into the returned
/// tool message instead.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The requested tool is not registered in the catalog.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Image validation or driver bring-up failed.
    #[error("tool setup failed: {0}")]
    Setup(String),

    /// The container could not be run to completion.
    #[error("tool execution failed: {0}")]
    Execution(String),

    /// The container exceeded its wall-clock ceiling.
    #[error("tool execution timed out after {0:?}")]
    Timeout(Duration),

    /// The owning task was cancelled mid-call.
    #[error("tool execution cancelled")]
    Cancelled,

    /// Host-side I/O while materializing mounts.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered, model-invocable tool.
///
/// `parameters` is the JSON Schema advertised to the model; argument values
/// for keys listed in `parameter_files` are written into files the container
/// sees at the mapped paths (strings verbatim, other values JSON-serialized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique name across the catalog.
    pub name: String,

    /// Container image reference.
    pub image: String,

    /// Description shown to the model.
    pub description: String,

    /// JSON Schema of the argument object.
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,

    /// Argument name to container path; each mapped argument is materialized
    /// as a file mounted at that path.
    #[serde(default)]
    pub parameter_files: HashMap<String, String>,

    /// Container path that receives a fresh copy of the task's attached
    /// files on every call.
    pub auxiliary_dir: Option<String>,

    /// Container path backed by a directory that persists for the lifetime
    /// of the owning task, across calls and across tools.
    pub shared_dir: Option<String>,

    /// Command run inside the container.
    pub command: Vec<String>,

    /// Environment passed to the container.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Default per-call wall-clock ceiling, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn default_timeout_secs() -> u64 {
    60
}

/// What one tool looks like to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Resolved per-call resource limits for one (task, tool) pairing.
#[derive(Debug, Clone, Default)]
pub struct CallLimits {
    /// Invocation budget; `None` means unlimited.
    pub max_calls: Option<u32>,

    /// Wall-clock ceiling per call.
    pub timeout: Option<Duration>,

    /// Container memory cap, megabytes.
    pub max_memory_mb: Option<u64>,

    /// Container CPU cap, percent of one core.
    pub cpu_percent: Option<u64>,
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// One container run, fully specified.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_percent: Option<u64>,
    pub timeout: Duration,
}

/// Captured output of a completed container run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Black-box container runtime.
///
/// Implementations build/verify images, run one container to completion with
/// mounts and resource caps, capture stdout, and tear everything down. The
/// driver never retries; policy lives above it.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Verifies the image is present and runnable. Called once per image per
    /// batch during pre-flight.
    async fn validate_image(&self, image: &str) -> SandboxResult<()>;

    /// Runs one container to completion. Network access is always disabled.
    async fn run(&self, cancel: &CancellationToken, spec: RunSpec) -> SandboxResult<RunOutput>;

    /// Releases driver resources.
    async fn close(&self) -> SandboxResult<()>;
}

/// Aggregated `{calls, total-duration}` for one tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolUsage {
    pub calls: u64,
    pub total_duration: Duration,
}

impl ToolUsage {
    fn record(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.total_duration += elapsed;
    }

    pub fn merge(&mut self, other: &ToolUsage) {
        self.calls += other.calls;
        self.total_duration += other.total_duration;
    }
}

/// Executes registered tools on behalf of running tasks.
///
/// Thread-safe; tasks on different provider workers invoke tools
/// concurrently and each call gets its own container. Scopes (one per task
/// execution) isolate call budgets and the shared directory.
pub struct ToolExecutor {
    driver: Arc<dyn SandboxDriver>,
    tools: RwLock<HashMap<String, ToolDefinition>>,
    validated_images: tokio::sync::Mutex<HashSet<String>>,
    /// (scope, tool) -> attempted container runs.
    calls: Mutex<HashMap<(String, String), u32>>,
    /// scope -> tool -> usage.
    usage: Mutex<HashMap<String, HashMap<String, ToolUsage>>>,
    /// scope -> shared directory, held until the task completes.
    shared_dirs: Mutex<HashMap<String, tempfile::TempDir>>,
}

impl ToolExecutor {
    pub fn new(driver: Arc<dyn SandboxDriver>) -> Self {
        Self {
            driver,
            tools: RwLock::new(HashMap::new()),
            validated_images: tokio::sync::Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
            shared_dirs: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a tool to the catalog. Last registration wins on name collision;
    /// the configuration layer rejects duplicates before they get here.
    pub fn register(&self, definition: ToolDefinition) {
        self.tools
            .write()
            .unwrap()
            .insert(definition.name.clone(), definition);
    }

    /// Looks up a registered tool.
    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.read().unwrap().get(name).cloned()
    }

    /// Validates a tool's image, at most once per image per batch.
    pub async fn validate(&self, name: &str) -> SandboxResult<()> {
        let definition = self
            .definition(name)
            .ok_or_else(|| SandboxError::ToolNotFound(name.to_string()))?;

        let mut validated = self.validated_images.lock().await;
        if validated.contains(&definition.image) {
            return Ok(());
        }
        self.driver.validate_image(&definition.image).await?;
        validated.insert(definition.image);
        Ok(())
    }

    /// Runs one tool call inside a fresh container and returns its stdout.
    ///
    /// Runtime failures (call budget exhausted, timeout, non-zero exit) are
    /// returned as `Ok` message bytes for the model; see the module docs.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        scope: &str,
        tool_name: &str,
        limits: &CallLimits,
        arguments: &serde_json::Value,
        files: &[Arc<FileReference>],
    ) -> SandboxResult<Vec<u8>> {
        let definition = self
            .definition(tool_name)
            .ok_or_else(|| SandboxError::ToolNotFound(tool_name.to_string()))?;

        if let Some(max_calls) = limits.max_calls {
            let calls = self.calls.lock().unwrap();
            let count = calls
                .get(&(scope.to_string(), tool_name.to_string()))
                .copied()
                .unwrap_or(0);
            if count >= max_calls {
                warn!(tool = tool_name, max_calls, "tool call limit reached");
                return Ok(format!(
                    "ERROR: tool call limit reached for '{}' (maximum {} calls); \
                     no further invocations are allowed in this task",
                    tool_name, max_calls
                )
                .into_bytes());
            }
        }
        *self
            .calls
            .lock()
            .unwrap()
            .entry((scope.to_string(), tool_name.to_string()))
            .or_insert(0) += 1;

        let mut mounts = Vec::new();

        // Argument values mapped through parameter_files land in one staging
        // directory; each file is mounted individually at its declared path.
        let param_dir = tempfile::tempdir()?;
        for (param, container_path) in &definition.parameter_files {
            let Some(value) = arguments.get(param) else {
                continue;
            };
            let bytes = match value {
                serde_json::Value::String(s) => s.clone().into_bytes(),
                other => serde_json::to_vec(other)
                    .map_err(|e| SandboxError::Execution(e.to_string()))?,
            };
            let host_path = param_dir.path().join(param);
            std::fs::write(&host_path, bytes)?;
            mounts.push(Mount {
                host_path,
                container_path: container_path.clone(),
                read_only: true,
            });
        }

        // Fresh copy of the task's attachments on every call.
        let aux_dir = match &definition.auxiliary_dir {
            Some(container_path) => {
                let dir = tempfile::tempdir()?;
                for file in files {
                    let bytes = file
                        .content()
                        .await
                        .map_err(|e| SandboxError::Execution(e.to_string()))?;
                    std::fs::write(dir.path().join(&file.name), bytes)?;
                }
                mounts.push(Mount {
                    host_path: dir.path().to_path_buf(),
                    container_path: container_path.clone(),
                    read_only: false,
                });
                Some(dir)
            }
            None => None,
        };

        if let Some(container_path) = &definition.shared_dir {
            let mut shared = self.shared_dirs.lock().unwrap();
            let dir = match shared.entry(scope.to_string()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => e.insert(tempfile::tempdir()?),
            };
            mounts.push(Mount {
                host_path: dir.path().to_path_buf(),
                container_path: container_path.clone(),
                read_only: false,
            });
        }

        let timeout = limits
            .timeout
            .unwrap_or(Duration::from_secs(definition.default_timeout_secs));
        let spec = RunSpec {
            image: definition.image.clone(),
            command: definition.command.clone(),
            env: definition.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            mounts,
            memory_limit_mb: limits.max_memory_mb,
            cpu_percent: limits.cpu_percent,
            timeout,
        };

        let start = Instant::now();
        let outcome = self.driver.run(cancel, spec).await;
        let elapsed = start.elapsed();

        self.usage
            .lock()
            .unwrap()
            .entry(scope.to_string())
            .or_default()
            .entry(tool_name.to_string())
            .or_default()
            .record(elapsed);

        drop(param_dir);
        drop(aux_dir);

        match outcome {
            Ok(output) if output.exit_code == 0 => {
                if !output.stderr.is_empty() {
                    debug!(tool = tool_name, stderr = %output.stderr, "tool stderr");
                }
                Ok(output.stdout)
            }
            Ok(output) => Ok(format!(
                "ERROR: tool '{}' exited with status {}\n{}",
                tool_name, output.exit_code, output.stderr
            )
            .into_bytes()),
            Err(SandboxError::Timeout(limit)) => Ok(format!(
                "ERROR: tool '{}' timed out after {:.0?}",
                tool_name, limit
            )
            .into_bytes()),
            Err(SandboxError::Execution(message)) => Ok(format!(
                "ERROR: tool '{}' failed to run: {}",
                tool_name, message
            )
            .into_bytes()),
            Err(other) => Err(other),
        }
    }

    /// Per-tool usage accumulated inside one scope.
    pub fn usage_for(&self, scope: &str) -> HashMap<String, ToolUsage> {
        self.usage
            .lock()
            .unwrap()
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    /// Per-tool usage aggregated across the whole batch.
    pub fn usage_stats(&self) -> HashMap<String, ToolUsage> {
        let usage = self.usage.lock().unwrap();
        let mut totals: HashMap<String, ToolUsage> = HashMap::new();
        for per_tool in usage.values() {
            for (tool, stats) in per_tool {
                totals.entry(tool.clone()).or_default().merge(stats);
            }
        }
        totals
    }

    /// Releases everything scoped to one task execution, including its
    /// shared directory. Idempotent.
    pub fn release(&self, scope: &str) {
        self.shared_dirs.lock().unwrap().remove(scope);
        self.calls
            .lock()
            .unwrap()
            .retain(|(call_scope, _), _| call_scope != scope);
    }

    pub async fn close(&self) -> SandboxResult<()> {
        self.driver.close().await
    }
}

/// A task execution's handle onto the executor.
///
/// Restricts the catalog to the task's enabled selections, resolves limit
/// overrides, and pins the scope used for call budgets and the shared
/// directory.
#[derive(Clone)]
pub struct ToolSession {
    executor: Arc<ToolExecutor>,
    scope: String,
    files: Vec<Arc<FileReference>>,
    limits: Arc<HashMap<String, CallLimits>>,
    specs: Arc<Vec<ToolSpec>>,
}

impl ToolSession {
    /// Builds a session for one task execution. Selections that reference an
    /// unregistered tool were rejected at pre-flight and are skipped here.
    pub fn new(executor: Arc<ToolExecutor>, scope: impl Into<String>, task: &Task) -> Self {
        let mut limits = HashMap::new();
        let mut specs = Vec::new();
        for selection in task.enabled_tools() {
            let Some(definition) = executor.definition(&selection.tool) else {
                continue;
            };
            limits.insert(
                selection.tool.clone(),
                CallLimits {
                    max_calls: selection.max_calls,
                    timeout: selection.per_call_timeout_secs.map(Duration::from_secs),
                    max_memory_mb: selection.max_memory_mb,
                    cpu_percent: selection.cpu_percent,
                },
            );
            specs.push(ToolSpec {
                name: definition.name.clone(),
                description: definition.description.clone(),
                parameters: definition.parameters.clone(),
            });
        }
        Self {
            executor,
            scope: scope.into(),
            files: task.files.clone(),
            limits: Arc::new(limits),
            specs: Arc::new(specs),
        }
    }

    /// Tool definitions to advertise to the model.
    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Executes one tool call and renders the result as a model-visible
    /// message.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> SandboxResult<String> {
        let limits = self
            .limits
            .get(tool_name)
            .ok_or_else(|| SandboxError::ToolNotFound(tool_name.to_string()))?;
        let stdout = self
            .executor
            .execute(cancel, &self.scope, tool_name, limits, arguments, &self.files)
            .await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Usage accumulated by this session so far.
    pub fn usage(&self) -> HashMap<String, ToolUsage> {
        self.executor.usage_for(&self.scope)
    }

    /// Releases the session's scope on the executor.
    pub fn release(&self) {
        self.executor.release(&self.scope);
    }
}
