//! Result records, the thread-safe aggregator, and the async result set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::provider::Usage;

/// Buffer size of the progress and message channels. Sends are non-blocking;
/// overflow is dropped, so a slow consumer costs events, never liveness.
pub(crate) const EVENT_BUFFER: usize = 64;

/// Classification of one (task, provider, run) outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    /// The answer was produced and validated as correct.
    Success,

    /// The answer was produced but rejected by validation.
    Failure,

    /// The task did not produce a validated answer.
    Error,

    /// The provider cannot support a feature the task requires.
    NotSupported,
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ResultKind::Success => "Success",
            ResultKind::Failure => "Failure",
            ResultKind::Error => "Error",
            ResultKind::NotSupported => "NotSupported",
        };
        f.write_str(label)
    }
}

/// The answer half of a result's details.
#[derive(Debug, Clone, Default)]
pub struct AnswerDetails {
    pub title: String,
    pub explanation: String,
    pub usage: Usage,
}

/// The validation half of a result's details.
#[derive(Debug, Clone, Default)]
pub struct ValidationDetails {
    pub title: String,
    pub explanation: String,
    pub usage: Usage,
}

/// Error context attached to `Error` and `NotSupported` results.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails {
    pub message: String,

    /// Raw model content, when the failure was a parsing one.
    pub raw_response: Option<String>,

    /// Service-reported stop reason, when available.
    pub stop_reason: Option<String>,

    /// Whatever usage accrued before the failure (tool calls included).
    pub usage: Usage,
}

/// Detail sections of a result; which are populated follows the kind.
///
/// | Kind | answer | validation | error |
/// |------|--------|------------|-------|
/// | `Success`/`Failure` | yes | yes | no |
/// | `Error` | no | no | yes |
/// | `NotSupported` | no | no | yes |
#[derive(Debug, Clone, Default)]
pub struct ResultDetails {
    pub answer: Option<AnswerDetails>,
    pub validation: Option<ValidationDetails>,
    pub error: Option<ErrorDetails>,
}

/// One (task, provider, run) outcome.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Globally unique, time-sortable correlation id.
    pub trace_id: String,

    pub kind: ResultKind,
    pub task_name: String,
    pub provider_name: String,
    pub run_name: String,

    /// Canonicalized accepted answers.
    pub want: Vec<String>,

    /// Canonicalized candidate answer, or the raw error message.
    pub got: String,

    pub details: ResultDetails,
    pub duration: Duration,
}

impl TaskResult {
    /// Stable identifier safe for file paths and HTML ids: a function of the
    /// (provider, run, task) triple only.
    pub fn id(&self) -> String {
        sanitize_id(&format!(
            "run-{}-{}-{}",
            self.provider_name, self.run_name, self.task_name
        ))
    }
}

/// Replaces spaces with `-` and anything outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ' ' => '-',
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => c,
            _ => '_',
        })
        .collect()
}

/// Completed results, grouped per provider in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    results: HashMap<String, Vec<TaskResult>>,
}

impl ResultSet {
    /// Ordered results of one provider.
    pub fn provider(&self, provider: &str) -> Option<&[TaskResult]> {
        self.results.get(provider).map(|r| r.as_slice())
    }

    /// provider-name -> ordered results.
    pub fn by_provider(&self) -> &HashMap<String, Vec<TaskResult>> {
        &self.results
    }

    /// Every result, without cross-provider ordering guarantees.
    pub fn all(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Groups one provider's results by run name, then kind, preserving
    /// per-run insertion order. Downstream formatters consume this shape.
    pub fn provider_results_by_run_and_kind(
        &self,
        provider: &str,
    ) -> HashMap<String, HashMap<ResultKind, Vec<&TaskResult>>> {
        let mut grouped: HashMap<String, HashMap<ResultKind, Vec<&TaskResult>>> = HashMap::new();
        for result in self.results.get(provider).into_iter().flatten() {
            grouped
                .entry(result.run_name.clone())
                .or_default()
                .entry(result.kind)
                .or_default()
                .push(result);
        }
        grouped
    }
}

/// Event senders handed to each provider worker. The channels close when the
/// last worker drops its clone.
#[derive(Clone)]
pub(crate) struct Emitter {
    pub(crate) progress: mpsc::Sender<f64>,
    pub(crate) messages: mpsc::Sender<String>,
}

impl Emitter {
    pub(crate) fn message(&self, text: String) {
        // Best-effort: drop on overflow rather than stall a worker.
        let _ = self.messages.try_send(text);
    }

    fn fraction(&self, value: f64) {
        let _ = self.progress.try_send(value);
    }
}

/// Mutex-guarded `provider -> ordered results` shared by the workers.
pub(crate) struct Collector {
    results: Mutex<HashMap<String, Vec<TaskResult>>>,
    completed: AtomicUsize,
    total: usize,
}

impl Collector {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            completed: AtomicUsize::new(0),
            total,
        }
    }

    /// Appends one result, then emits the progress and message events.
    /// Events always trail the append they describe.
    pub(crate) fn record(&self, emitter: &Emitter, result: TaskResult) {
        let message = format!(
            "[{}/{}] {} -> {} ({:.2?})",
            result.provider_name, result.run_name, result.task_name, result.kind, result.duration
        );
        self.results
            .lock()
            .unwrap()
            .entry(result.provider_name.clone())
            .or_default()
            .push(result);

        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        emitter.fraction(completed as f64 / self.total.max(1) as f64);
        emitter.message(message);
    }

    /// Full clone of the current state; safe to hand to formatters while
    /// workers are still appending.
    pub(crate) fn snapshot(&self) -> ResultSet {
        ResultSet {
            results: self.results.lock().unwrap().clone(),
        }
    }
}

/// Handle returned by the asynchronous entry point.
///
/// Progress values are fractions in `0..=1`; message events are one-line
/// human-readable strings. Both channels are best-effort and close when
/// execution completes (or unwinds after cancellation).
pub struct AsyncResultSet {
    pub(crate) collector: Arc<Collector>,
    pub(crate) progress_rx: mpsc::Receiver<f64>,
    pub(crate) message_rx: mpsc::Receiver<String>,
    pub(crate) cancel: CancellationToken,
    pub(crate) supervisor: tokio::task::JoinHandle<()>,
    pub(crate) total: usize,
}

impl AsyncResultSet {
    /// Total number of (task, run) executions in the batch.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Receive-only progress channel.
    pub fn progress_events(&mut self) -> &mut mpsc::Receiver<f64> {
        &mut self.progress_rx
    }

    /// Receive-only message channel.
    pub fn message_events(&mut self) -> &mut mpsc::Receiver<String> {
        &mut self.message_rx
    }

    /// Both event channels, for consumers that select over them.
    pub fn events(&mut self) -> (&mut mpsc::Receiver<f64>, &mut mpsc::Receiver<String>) {
        (&mut self.progress_rx, &mut self.message_rx)
    }

    /// Cancels the batch. In-flight executions unwind promptly and report as
    /// `Error`; queued executions are skipped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until every worker has finished, then returns the results.
    /// After cancellation this returns whatever completed.
    pub async fn results(self) -> ResultSet {
        let _ = self.supervisor.await;
        self.collector.snapshot()
    }
}
