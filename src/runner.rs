//! Batch scheduling and execution.
//!
//! The runner fans one worker out per configured provider; inside a worker,
//! run variants and tasks proceed strictly in declaration order, so a
//! provider never sees more than one outstanding request and run variants
//! never interleave. Workers share nothing but the result collector and the
//! completion counter.
//!
//! ```text
//!                 Runner::start(cancel, tasks)
//!                          │  assert_can_run (pre-flight)
//!          ┌───────────────┼───────────────┐
//!          ▼               ▼               ▼
//!     worker(p1)      worker(p2)      worker(p3)        one per provider
//!     for run in runs (ordered)
//!       for task in tasks (ordered)
//!         RunExecutor ──► ProviderAdapter ──► Validator
//!              │                                  │
//!              └────────── TaskResult ◄───────────┘
//!                              │ append, then emit progress
//!                              ▼
//!                         Collector ──► AsyncResultSet
//! ```
//!
//! # Outcome classification
//!
//! A worker never fails: every (run, task) pair yields exactly one
//! [`TaskResult`]. Validator verdicts map to `Success`/`Failure`; a
//! `FeatureNotSupported` error maps to `NotSupported`; everything else maps
//! to `Error`, including judge failures, parse failures, cancellation, and
//! recovered panics.

pub mod results;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use ulid::Ulid;

use crate::executor::RunExecutor;
use crate::provider::{CallContext, ProviderAdapter, ProviderError, RunConfig, Usage};
use crate::sandbox::{ToolExecutor, ToolSession, ToolUsage};
use crate::task::{AnswerPayload, ResponseFormat, Task};
use crate::validator::{ValidationRules, Validator, ValidatorFactory};

use results::{
    AnswerDetails, AsyncResultSet, Collector, ErrorDetails, EVENT_BUFFER, Emitter, ResultDetails,
    ResultKind, ResultSet, TaskResult, ValidationDetails,
};

/// One configured provider: its adapter and its ordered run variants.
pub struct ProviderEntry {
    pub name: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub runs: Vec<RunConfig>,
}

/// Evaluates task batches against the configured providers.
pub struct Runner {
    providers: Vec<ProviderEntry>,
    validators: Arc<ValidatorFactory>,
    tools: Option<Arc<ToolExecutor>>,
    default_rules: ValidationRules,
}

impl Runner {
    pub fn new(
        providers: Vec<ProviderEntry>,
        validators: ValidatorFactory,
        tools: Option<ToolExecutor>,
        default_rules: ValidationRules,
    ) -> Self {
        Self {
            providers,
            validators: Arc::new(validators),
            tools: tools.map(Arc::new),
            default_rules,
        }
    }

    /// Pre-flight configuration check; every problem in the batch is
    /// aggregated into one error so nothing starts half-broken.
    ///
    /// Validates task-name uniqueness, expected-result shape and schema
    /// conformance, judge selections, and referenced tools (including the
    /// one-time image validation, remembered per batch).
    pub async fn assert_can_run(&self, tasks: &[Arc<Task>]) -> Result<()> {
        let mut errors = Vec::new();

        let mut seen = BTreeSet::new();
        for task in tasks {
            if !seen.insert(task.name.as_str()) {
                errors.push(format!("duplicate task name {:?}", task.name));
            }
        }

        for task in tasks {
            if task.expected.is_empty() {
                errors.push(format!("task {:?} has no expected results", task.name));
            }

            let rules = self.default_rules.merged(task.rules.as_ref());
            for problem in self.validators.preflight(&rules, &task.response_format) {
                errors.push(format!("task {:?}: {problem}", task.name));
            }

            if let ResponseFormat::Schema(schema) = &task.response_format {
                match jsonschema::validator_for(schema) {
                    Ok(compiled) => {
                        for (index, value) in task.expected.iter().enumerate() {
                            match value {
                                AnswerPayload::Structured(json) if compiled.is_valid(json) => {}
                                AnswerPayload::Structured(_) => errors.push(format!(
                                    "task {:?}: expected result #{} does not conform to the response schema",
                                    task.name,
                                    index + 1
                                )),
                                AnswerPayload::Text(_) => errors.push(format!(
                                    "task {:?}: expected result #{} is text but the response format is structured",
                                    task.name,
                                    index + 1
                                )),
                            }
                        }
                    }
                    Err(e) => {
                        errors.push(format!("task {:?}: invalid response schema: {e}", task.name));
                    }
                }
            }
        }

        // Referenced tools are validated once each, even when many tasks
        // select them.
        let referenced: BTreeSet<&str> = tasks
            .iter()
            .flat_map(|task| task.enabled_tools().map(|s| s.tool.as_str()))
            .collect();
        if !referenced.is_empty() {
            match &self.tools {
                None => errors.push(format!(
                    "tasks reference tools ({}) but no sandbox is configured",
                    referenced.into_iter().collect::<Vec<_>>().join(", ")
                )),
                Some(executor) => {
                    for name in referenced {
                        if executor.definition(name).is_none() {
                            errors.push(format!("tool {:?} is not defined", name));
                        } else if let Err(e) = executor.validate(name).await {
                            errors.push(format!("tool {:?}: {e}", name));
                        }
                    }
                }
            }
        }

        if !errors.is_empty() {
            bail!("batch cannot start:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    /// Synchronous entry point: executes the batch and returns the completed
    /// result set.
    pub async fn run(&self, cancel: CancellationToken, tasks: Vec<Arc<Task>>) -> Result<ResultSet> {
        let handle = self.start(cancel, tasks).await?;
        Ok(handle.results().await)
    }

    /// Asynchronous entry point: returns immediately with a handle exposing
    /// progress/message events, cancellation, and blocking result access.
    pub async fn start(
        &self,
        cancel: CancellationToken,
        tasks: Vec<Arc<Task>>,
    ) -> Result<AsyncResultSet> {
        self.assert_can_run(&tasks).await?;

        let runs_total: usize = self.providers.iter().map(|p| p.runs.len()).sum();
        let total = tasks.len() * runs_total;
        info!(
            tasks = tasks.len(),
            providers = self.providers.len(),
            executions = total,
            "starting batch"
        );

        let tasks = Arc::new(tasks);
        let collector = Arc::new(Collector::new(total));
        let (progress_tx, progress_rx) = mpsc::channel(EVENT_BUFFER);
        let (message_tx, message_rx) = mpsc::channel(EVENT_BUFFER);
        let emitter = Emitter {
            progress: progress_tx,
            messages: message_tx,
        };

        let mut workers = tokio::task::JoinSet::new();
        for entry in &self.providers {
            let worker = Worker {
                provider_name: entry.name.clone(),
                adapter: Arc::clone(&entry.adapter),
                runs: entry.runs.clone(),
                tasks: Arc::clone(&tasks),
                collector: Arc::clone(&collector),
                emitter: emitter.clone(),
                validators: Arc::clone(&self.validators),
                tools: self.tools.clone(),
                default_rules: self.default_rules.clone(),
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run());
        }
        // Workers hold the only live senders; the event channels close when
        // the last worker finishes.
        drop(emitter);

        let supervisor = tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
        });

        Ok(AsyncResultSet {
            collector,
            progress_rx,
            message_rx,
            cancel,
            supervisor,
            total,
        })
    }

    /// Releases providers, judges, and the sandbox.
    pub async fn close(&self) {
        for entry in &self.providers {
            if let Err(e) = entry.adapter.close().await {
                warn!(provider = %entry.name, error = %e, "failed to close provider");
            }
        }
        self.validators.close().await;
        if let Some(tools) = &self.tools
            && let Err(e) = tools.close().await
        {
            warn!(error = %e, "failed to close sandbox");
        }
    }
}

struct Worker {
    provider_name: String,
    adapter: Arc<dyn ProviderAdapter>,
    runs: Vec<RunConfig>,
    tasks: Arc<Vec<Arc<Task>>>,
    collector: Arc<Collector>,
    emitter: Emitter,
    validators: Arc<ValidatorFactory>,
    tools: Option<Arc<ToolExecutor>>,
    default_rules: ValidationRules,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        for run in &self.runs {
            // The rate limiter lives here: once per run, shared by every
            // task call of the run, gone when the run ends.
            let executor = RunExecutor::new(run);
            for task in self.tasks.iter() {
                if self.cancel.is_cancelled() {
                    return;
                }
                let result = self.run_one(&executor, run, task).await;
                self.collector.record(&self.emitter, result);
            }
        }
    }

    async fn run_one(&self, executor: &RunExecutor, run: &RunConfig, task: &Arc<Task>) -> TaskResult {
        let trace_id = Ulid::new().to_string();
        let span = info_span!(
            "task",
            trace_id = %trace_id,
            provider = %self.provider_name,
            run = %run.name,
            task = %task.name
        );

        self.execute_one(trace_id, executor, run, task)
            .instrument(span)
            .await
    }

    async fn execute_one(
        &self,
        trace_id: String,
        executor: &RunExecutor,
        run: &RunConfig,
        task: &Arc<Task>,
    ) -> TaskResult {
        let start = Instant::now();
        let rules = self.default_rules.merged(task.rules.as_ref());

        let base = |kind: ResultKind, got: String, details: ResultDetails| TaskResult {
            trace_id: trace_id.clone(),
            kind,
            task_name: task.name.clone(),
            provider_name: self.provider_name.clone(),
            run_name: run.name.clone(),
            want: Vec::new(),
            got,
            details,
            duration: start.elapsed(),
        };

        let validator: Arc<dyn Validator> =
            match self.validators.resolve(&rules, &task.response_format) {
                Ok(v) => v,
                Err(e) => {
                    // Pre-flight makes this unreachable for well-formed
                    // batches; tasks added behind its back still get a
                    // result instead of a crash.
                    return base(
                        ResultKind::Error,
                        format!("{e:#}"),
                        ResultDetails {
                            error: Some(ErrorDetails {
                                message: format!("Validation Error: {e:#}"),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    );
                }
            };

        let want: Vec<String> = task
            .expected
            .iter()
            .map(|value| validator.canonical(&rules, value))
            .collect();

        let session = match (&self.tools, task.uses_tools()) {
            (Some(tools), true) => Some(ToolSession::new(Arc::clone(tools), &*trace_id, task)),
            _ => None,
        };
        let cx = CallContext::with_tools(self.cancel.clone(), session.clone());

        let adapter = &self.adapter;
        let emitter = &self.emitter;
        let provider_name = &self.provider_name;
        let outcome = std::panic::AssertUnwindSafe(executor.execute(
            &self.cancel,
            |_| adapter.run(&cx, run, task),
            |attempt, delay| {
                warn!(attempt, ?delay, "transient provider error, backing off");
                emitter.message(format!(
                    "[{}/{}] {}: transient error on attempt {}, retrying in {:.0?}",
                    provider_name, run.name, task.name, attempt, delay
                ));
            },
        ))
        .catch_unwind()
        .await;

        let tool_usage = session.as_ref().map(|s| s.usage()).unwrap_or_default();

        let mut result = match outcome {
            Err(panic) => {
                let message = panic_message(panic);
                warn!(message = %message, "task worker panicked");
                base(
                    ResultKind::Error,
                    format!("panic: {message}"),
                    ResultDetails {
                        error: Some(ErrorDetails {
                            message: format!("panic: {message}"),
                            usage: usage_with_tools(tool_usage),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
            }
            Ok(Ok(response)) => {
                match validator
                    .is_correct(&self.cancel, &rules, &task.expected, &response, task)
                    .await
                {
                    Ok(verdict) => {
                        let kind = if verdict.is_correct {
                            ResultKind::Success
                        } else {
                            ResultKind::Failure
                        };
                        base(
                            kind,
                            validator.canonical(&rules, &response.answer),
                            ResultDetails {
                                answer: Some(AnswerDetails {
                                    title: response.title.clone(),
                                    explanation: response.explanation.clone(),
                                    usage: response.usage.clone(),
                                }),
                                validation: Some(ValidationDetails {
                                    title: verdict.title,
                                    explanation: verdict.explanation,
                                    usage: verdict.usage,
                                }),
                                error: None,
                            },
                        )
                    }
                    Err(e) => base(
                        ResultKind::Error,
                        validator.canonical(&rules, &response.answer),
                        ResultDetails {
                            error: Some(ErrorDetails {
                                message: format!("Validation Error: {e:#}"),
                                usage: response.usage.clone(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ),
                }
            }
            Ok(Err(ProviderError::FeatureNotSupported(message))) => base(
                ResultKind::NotSupported,
                message.clone(),
                ResultDetails {
                    error: Some(ErrorDetails {
                        message,
                        usage: usage_with_tools(tool_usage),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
            Ok(Err(ProviderError::UnmarshalResponse {
                reason,
                raw,
                stop_reason,
            })) => base(
                ResultKind::Error,
                format!("failed to parse model response: {reason}"),
                ResultDetails {
                    error: Some(ErrorDetails {
                        message: format!("failed to parse model response: {reason}"),
                        raw_response: Some(raw),
                        stop_reason,
                        usage: usage_with_tools(tool_usage),
                    }),
                    ..Default::default()
                },
            ),
            Ok(Err(error)) => base(
                ResultKind::Error,
                error.to_string(),
                ResultDetails {
                    error: Some(ErrorDetails {
                        message: error.to_string(),
                        usage: usage_with_tools(tool_usage),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
        };
        result.want = want;

        if let Some(session) = session {
            session.release();
        }
        result
    }
}

fn usage_with_tools(tool_usage: HashMap<String, ToolUsage>) -> Usage {
    Usage {
        input_tokens: None,
        output_tokens: None,
        tool_usage,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
