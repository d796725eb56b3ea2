//! Scriptable in-process adapter.
//!
//! Stands in for a remote service in the integration suite and doubles as an
//! offline judge. Behavior is a closure over the call descriptor, so tests
//! can script per-task outcomes, transient failures, tool conversations, or
//! slow responses without any network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use super::{
    CallContext, ProviderAdapter, ProviderError, ProviderResponse, RunConfig, Usage,
};
use crate::task::{AnswerPayload, Task};

/// Everything a scripted behavior gets to look at.
#[derive(Clone)]
pub struct MockCall {
    pub cx: CallContext,
    pub run_name: String,
    pub model: String,
    pub task_name: String,
    pub prompt: String,
    pub expected: Vec<AnswerPayload>,
    /// 1-based attempt counter per (run, task), across retries.
    pub attempt: u32,
}

/// Scripted behavior of a [`MockProvider`].
pub type MockHandler =
    Arc<dyn Fn(MockCall) -> BoxFuture<'static, Result<ProviderResponse, ProviderError>> + Send + Sync>;

/// An adapter whose responses are produced by a closure.
pub struct MockProvider {
    name: String,
    handler: MockHandler,
    attempts: Mutex<HashMap<(String, String), u32>>,
}

impl MockProvider {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(MockCall) -> BoxFuture<'static, Result<ProviderResponse, ProviderError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// A provider that always answers with the task's first expected result.
    ///
    /// Useful as an always-pass run and as a deterministic judge.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, |call: MockCall| {
            Box::pin(async move {
                let answer = call
                    .expected
                    .first()
                    .cloned()
                    .unwrap_or(AnswerPayload::Text(String::new()));
                Ok(response(answer))
            })
        })
    }

    /// Provider calls observed for one (run, task) pair.
    pub fn call_count(&self, run_name: &str, task_name: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&(run_name.to_string(), task_name.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Builds a well-formed response around the given answer.
pub fn response(answer: AnswerPayload) -> ProviderResponse {
    ProviderResponse {
        title: "Mock Answer".to_string(),
        explanation: "scripted response".to_string(),
        answer,
        prompts: Vec::new(),
        usage: Usage {
            input_tokens: Some(10),
            output_tokens: Some(5),
            tool_usage: HashMap::new(),
        },
        duration: Duration::from_millis(1),
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        cx: &CallContext,
        run: &RunConfig,
        task: &Task,
    ) -> Result<ProviderResponse, ProviderError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts
                .entry((run.name.clone(), task.name.clone()))
                .or_insert(0);
            *entry += 1;
            *entry
        };

        let call = MockCall {
            cx: cx.clone(),
            run_name: run.name.clone(),
            model: run.model.clone(),
            task_name: task.name.clone(),
            prompt: task.prompt.clone(),
            expected: task.expected.clone(),
            attempt,
        };

        let mut result = (self.handler)(call).await;
        if let Ok(resp) = &mut result
            && let Some(session) = &cx.tools
        {
            resp.usage.tool_usage = session.usage();
        }
        result
    }
}
