//! End-to-end runner scenarios against the scriptable mock provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mindtrial::provider::mock::{MockProvider, response};
use mindtrial::provider::{ModelParams, ProviderError, RetryPolicy, RunConfig};
use mindtrial::runner::results::ResultKind;
use mindtrial::runner::{ProviderEntry, Runner};
use mindtrial::sandbox::{
    RunOutput, RunSpec, SandboxDriver, SandboxResult, ToolDefinition, ToolExecutor,
};
use mindtrial::task::{AnswerPayload, ResponseFormat, Task, ToolSelection};
use mindtrial::validator::judge::{JudgeDefinition, JudgeVariant};
use mindtrial::validator::{JudgeSelector, RuleOverrides, ValidationRules, ValidatorFactory};

fn text_task(name: &str, expected: &[&str]) -> Arc<Task> {
    Arc::new(Task {
        name: name.to_string(),
        prompt: format!("prompt for {name}"),
        response_format: ResponseFormat::Text("plain text".to_string()),
        expected: expected
            .iter()
            .map(|e| AnswerPayload::Text(e.to_string()))
            .collect(),
        files: vec![],
        rules: None,
        tools: vec![],
        system_prompt: None,
    })
}

fn run_config(name: &str, retry: Option<RetryPolicy>) -> RunConfig {
    RunConfig {
        name: name.to_string(),
        model: "mock-model".to_string(),
        max_rpm: 0,
        retry,
        params: ModelParams::default(),
    }
}

fn runner_for(providers: Vec<ProviderEntry>) -> Runner {
    Runner::new(
        providers,
        ValidatorFactory::new(vec![]),
        None,
        ValidationRules::default(),
    )
}

/// Scenario: one provider, two runs; the first run produces mixed kinds in
/// task order, the second passes everything.
#[tokio::test]
async fn mixed_kinds_single_provider_two_runs() {
    let adapter = Arc::new(MockProvider::new("mock-service", |call| {
        Box::pin(async move {
            if call.run_name == "pass" {
                return Ok(response(call.expected[0].clone()));
            }
            if call.task_name.starts_with("success") {
                Ok(response(call.expected[0].clone()))
            } else if call.task_name.starts_with("failure") {
                Ok(response(AnswerPayload::Text("a fixed wrong answer".into())))
            } else {
                Err(ProviderError::Other(anyhow::anyhow!("scripted task error")))
            }
        })
    }));

    let runner = runner_for(vec![ProviderEntry {
        name: "mock-provider".to_string(),
        adapter: adapter.clone(),
        runs: vec![run_config("mock", None), run_config("pass", None)],
    }]);

    let tasks = vec![
        text_task("success-1", &["Alpha"]),
        text_task("failure-1", &["Beta"]),
        text_task("error-1", &["Gamma"]),
        text_task("failure-2", &["Delta"]),
        text_task("success-2", &["Epsilon"]),
    ];

    let results = runner
        .run(CancellationToken::new(), tasks)
        .await
        .expect("batch runs");

    assert_eq!(results.len(), 10);

    let provider_results = results.provider("mock-provider").unwrap();
    let kinds: Vec<ResultKind> = provider_results.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        [
            // run "mock", in input task order
            ResultKind::Success,
            ResultKind::Failure,
            ResultKind::Error,
            ResultKind::Failure,
            ResultKind::Success,
            // run "pass" strictly afterwards
            ResultKind::Success,
            ResultKind::Success,
            ResultKind::Success,
            ResultKind::Success,
            ResultKind::Success,
        ]
    );

    // Per-provider run order: every "mock" result precedes every "pass" one.
    let first_pass = provider_results
        .iter()
        .position(|r| r.run_name == "pass")
        .unwrap();
    assert!(provider_results[..first_pass].iter().all(|r| r.run_name == "mock"));
    assert_eq!(first_pass, 5);

    // Task order within each run matches input order.
    let mock_tasks: Vec<&str> = provider_results[..5]
        .iter()
        .map(|r| r.task_name.as_str())
        .collect();
    assert_eq!(
        mock_tasks,
        ["success-1", "failure-1", "error-1", "failure-2", "success-2"]
    );

    // Trace ids are pairwise distinct.
    let traces: std::collections::HashSet<&str> =
        results.all().map(|r| r.trace_id.as_str()).collect();
    assert_eq!(traces.len(), 10);

    // Kind determines which detail sections are populated.
    for result in results.all() {
        match result.kind {
            ResultKind::Success | ResultKind::Failure => {
                assert!(result.details.answer.is_some());
                assert!(result.details.validation.is_some());
                assert!(result.details.error.is_none());
            }
            ResultKind::Error | ResultKind::NotSupported => {
                assert!(result.details.error.is_some());
                assert!(result.details.answer.is_none());
            }
        }
    }
}

/// Scenario: two transient failures, then success, within a four-retry
/// budget.
#[tokio::test]
async fn retry_succeeds_within_budget() {
    let adapter = Arc::new(MockProvider::new("flaky", |call| {
        Box::pin(async move {
            if call.attempt < 3 {
                Err(ProviderError::Retryable("transient outage".into()))
            } else {
                Ok(response(call.expected[0].clone()))
            }
        })
    }));

    let runner = runner_for(vec![ProviderEntry {
        name: "flaky".to_string(),
        adapter: adapter.clone(),
        runs: vec![run_config(
            "default",
            Some(RetryPolicy {
                max_attempts: 4,
                initial_delay: Duration::from_millis(1),
            }),
        )],
    }]);

    let results = runner
        .run(CancellationToken::new(), vec![text_task("retry_2", &["ok"])])
        .await
        .unwrap();

    let result = &results.provider("flaky").unwrap()[0];
    assert_eq!(result.kind, ResultKind::Success);
    assert_eq!(adapter.call_count("default", "retry_2"), 3);
    assert!(
        result
            .details
            .answer
            .as_ref()
            .unwrap()
            .explanation
            .contains("after 3 attempts")
    );
}

/// Scenario: the retry budget runs out and the task reports an error after
/// exactly initial + max_attempts calls.
#[tokio::test]
async fn retry_exhausted_reports_error() {
    let adapter = Arc::new(MockProvider::new("down", |_| {
        Box::pin(async { Err(ProviderError::Retryable("still down".into())) })
    }));

    let runner = runner_for(vec![ProviderEntry {
        name: "down".to_string(),
        adapter: adapter.clone(),
        runs: vec![run_config(
            "default",
            Some(RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
            }),
        )],
    }]);

    let results = runner
        .run(CancellationToken::new(), vec![text_task("retry_5", &["ok"])])
        .await
        .unwrap();

    let result = &results.provider("down").unwrap()[0];
    assert_eq!(result.kind, ResultKind::Error);
    assert_eq!(adapter.call_count("default", "retry_5"), 3);
    assert!(
        result
            .details
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("transient")
    );
}

/// Scenario: cancellation mid-batch keeps completed results, reports
/// in-flight work as errors, and closes both event channels.
#[tokio::test]
async fn cancellation_mid_batch() {
    let slow_provider = |name: &str| {
        let adapter = Arc::new(MockProvider::new(name, |call| {
            Box::pin(async move {
                if call.task_name == "fast" {
                    return Ok(response(call.expected[0].clone()));
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        Ok(response(call.expected[0].clone()))
                    }
                    _ = call.cx.cancel.cancelled() => Err(ProviderError::Cancelled),
                }
            })
        }));
        ProviderEntry {
            name: name.to_string(),
            adapter,
            runs: vec![run_config("default", None)],
        }
    };

    let runner = runner_for(vec![slow_provider("p1"), slow_provider("p2")]);
    let tasks = vec![
        text_task("fast", &["ok"]),
        text_task("slow-1", &["ok"]),
        text_task("slow-2", &["ok"]),
    ];

    let cancel = CancellationToken::new();
    let mut handle = runner.start(cancel, tasks).await.unwrap();
    let total = handle.total();
    assert_eq!(total, 6);

    // Wait for the first completed result, then cut the batch.
    let first = handle.progress_events().recv().await.expect("one result completes");
    assert!(first > 0.0);
    handle.cancel();

    let results = handle.results().await;
    assert!(results.len() >= 1, "fast results are retained");
    assert!(results.len() < total, "cancelled work is not completed");

    // In-flight tasks surfaced as cancellation errors.
    assert!(
        results
            .all()
            .filter(|r| r.kind == ResultKind::Error)
            .all(|r| r.details.error.as_ref().unwrap().message.contains("cancelled"))
    );
}

#[tokio::test]
async fn event_channels_close_after_completion() {
    let adapter = Arc::new(MockProvider::echo("echo"));
    let runner = runner_for(vec![ProviderEntry {
        name: "echo".to_string(),
        adapter,
        runs: vec![run_config("default", None)],
    }]);

    let tasks = vec![text_task("a", &["x"]), text_task("b", &["y"])];
    let mut handle = runner.start(CancellationToken::new(), tasks).await.unwrap();

    // Drain both channels to their close; progress must be non-decreasing
    // and end at 1.0.
    let mut last = 0.0_f64;
    while let Some(fraction) = handle.progress_events().recv().await {
        assert!(fraction >= last, "progress must be monotonic");
        assert!(fraction <= 1.0);
        last = fraction;
    }
    assert!((last - 1.0).abs() < f64::EPSILON);

    while handle.message_events().recv().await.is_some() {}

    let results = handle.results().await;
    assert_eq!(results.len(), 2);
}

struct ScriptedDriver;

#[async_trait::async_trait]
impl SandboxDriver for ScriptedDriver {
    async fn validate_image(&self, _image: &str) -> SandboxResult<()> {
        Ok(())
    }

    async fn run(&self, _cancel: &CancellationToken, _spec: RunSpec) -> SandboxResult<RunOutput> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(RunOutput {
            exit_code: 0,
            stdout: b"X".to_vec(),
            stderr: String::new(),
        })
    }

    async fn close(&self) -> SandboxResult<()> {
        Ok(())
    }
}

fn python_tool() -> ToolDefinition {
    ToolDefinition {
        name: "python-code-executor".to_string(),
        image: "python:3-slim".to_string(),
        description: "Execute a Python snippet".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {"code": {"type": "string"}},
            "required": ["code"],
        }),
        parameter_files: HashMap::from([("code".to_string(), "/input/code.py".to_string())]),
        auxiliary_dir: None,
        shared_dir: None,
        command: vec!["python".to_string(), "/input/code.py".to_string()],
        env: HashMap::new(),
        default_timeout_secs: 5,
    }
}

fn tool_task(name: &str, expected: &str) -> Arc<Task> {
    Arc::new(Task {
        name: name.to_string(),
        prompt: "compute X".to_string(),
        response_format: ResponseFormat::Text("plain text".to_string()),
        expected: vec![AnswerPayload::Text(expected.to_string())],
        files: vec![],
        rules: None,
        tools: vec![ToolSelection {
            tool: "python-code-executor".to_string(),
            enabled: true,
            max_calls: Some(2),
            per_call_timeout_secs: None,
            max_memory_mb: None,
            cpu_percent: None,
        }],
        system_prompt: None,
    })
}

/// Scenario: the model requests one tool call and answers with its output;
/// a greedier task runs into the call limit and sees the limit message as a
/// tool result instead of aborting.
#[tokio::test]
async fn tool_conversation_and_call_limit() {
    let adapter = Arc::new(MockProvider::new("tooling", |call| {
        Box::pin(async move {
            let session = call.cx.tools.as_ref().expect("task enables tools");
            let args = serde_json::json!({"code": "print('X')"});

            if call.task_name == "tool-user" {
                let out = session
                    .execute(&call.cx.cancel, "python-code-executor", &args)
                    .await
                    .unwrap();
                Ok(response(AnswerPayload::Text(out)))
            } else {
                // Burn the two-call budget, then observe the limit message.
                for _ in 0..2 {
                    session
                        .execute(&call.cx.cancel, "python-code-executor", &args)
                        .await
                        .unwrap();
                }
                let third = session
                    .execute(&call.cx.cancel, "python-code-executor", &args)
                    .await
                    .unwrap();
                Ok(response(AnswerPayload::Text(third)))
            }
        })
    }));

    let executor = ToolExecutor::new(Arc::new(ScriptedDriver));
    executor.register(python_tool());

    let runner = Runner::new(
        vec![ProviderEntry {
            name: "tooling".to_string(),
            adapter,
            runs: vec![run_config("default", None)],
        }],
        ValidatorFactory::new(vec![]),
        Some(executor),
        ValidationRules::default(),
    );

    let tasks = vec![
        tool_task("tool-user", "X"),
        tool_task("tool-greedy", "unreachable"),
    ];
    let results = runner.run(CancellationToken::new(), tasks).await.unwrap();
    let provider_results = results.provider("tooling").unwrap();

    let tool_user = &provider_results[0];
    assert_eq!(tool_user.kind, ResultKind::Success);
    let usage = &tool_user.details.answer.as_ref().unwrap().usage;
    let tool_usage = &usage.tool_usage["python-code-executor"];
    assert_eq!(tool_usage.calls, 1);
    assert!(tool_usage.total_duration > Duration::ZERO);

    // The third call surfaced as a model-visible message, and the task
    // completed (as a Failure, since the message is not the expected answer).
    let greedy = &provider_results[1];
    assert_eq!(greedy.kind, ResultKind::Failure);
    assert!(greedy.got.contains("tool call limit reached"));
    assert_eq!(
        greedy.details.answer.as_ref().unwrap().usage.tool_usage["python-code-executor"].calls,
        2
    );
}

/// Scenario: judge-based semantic validation passes and records the judge's
/// usage under the validation details.
#[tokio::test]
async fn judge_semantic_pass() {
    let task_adapter = Arc::new(MockProvider::new("verbatim", |call| {
        Box::pin(async move { Ok(response(call.expected[0].clone())) })
    }));

    let judge = JudgeDefinition {
        name: "semantic".to_string(),
        disabled: false,
        template: None,
        verdict_format: None,
        passing_verdicts: None,
        variants: HashMap::from([(
            "default".to_string(),
            JudgeVariant::new(Arc::new(MockProvider::echo("judge")), run_config("verdict", None)),
        )]),
    };

    let runner = Runner::new(
        vec![ProviderEntry {
            name: "verbatim".to_string(),
            adapter: task_adapter,
            runs: vec![run_config("default", None)],
        }],
        ValidatorFactory::new(vec![judge]),
        None,
        ValidationRules::default(),
    );

    let task = Arc::new(Task {
        name: "lorem".to_string(),
        prompt: "Pick the right phrase.".to_string(),
        response_format: ResponseFormat::Text("a short phrase".to_string()),
        expected: vec![
            AnswerPayload::Text("rerum nam illo".to_string()),
            AnswerPayload::Text("dolore praesentium non".to_string()),
        ],
        files: vec![],
        rules: Some(RuleOverrides {
            judge: Some(JudgeSelector {
                enabled: true,
                name: "semantic".to_string(),
                variant: "default".to_string(),
                prompt_override: None,
            }),
            ..Default::default()
        }),
        tools: vec![],
        system_prompt: None,
    });

    let results = runner
        .run(CancellationToken::new(), vec![task])
        .await
        .unwrap();
    let result = &results.provider("verbatim").unwrap()[0];

    assert_eq!(result.kind, ResultKind::Success);
    let validation = result.details.validation.as_ref().unwrap();
    assert_eq!(validation.title, "Semantic Assessment");
    assert_eq!(validation.usage.input_tokens, Some(10));
}

/// Pre-flight refuses to start a batch with a missing judge or duplicate
/// task names, and names every problem at once.
#[tokio::test]
async fn preflight_aggregates_failures() {
    let runner = runner_for(vec![ProviderEntry {
        name: "echo".to_string(),
        adapter: Arc::new(MockProvider::echo("echo")),
        runs: vec![run_config("default", None)],
    }]);

    let mut bad_judge = (*text_task("a", &["x"])).clone();
    bad_judge.rules = Some(RuleOverrides {
        judge: Some(JudgeSelector {
            enabled: true,
            name: "ghost".to_string(),
            variant: "v".to_string(),
            prompt_override: None,
        }),
        ..Default::default()
    });

    let tasks = vec![
        Arc::new(bad_judge),
        text_task("dup", &["x"]),
        text_task("dup", &["x"]),
    ];

    let err = runner
        .run(CancellationToken::new(), tasks)
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("duplicate task name"));
    assert!(err.contains("ghost"));
}

/// NotSupported classification flows through from the adapter.
#[tokio::test]
async fn feature_not_supported_maps_to_not_supported() {
    let adapter = Arc::new(MockProvider::new("limited", |_| {
        Box::pin(async {
            Err(ProviderError::FeatureNotSupported(
                "structured output is unavailable".into(),
            ))
        })
    }));
    let runner = runner_for(vec![ProviderEntry {
        name: "limited".to_string(),
        adapter,
        runs: vec![run_config("default", None)],
    }]);

    let results = runner
        .run(CancellationToken::new(), vec![text_task("t", &["x"])])
        .await
        .unwrap();
    assert_eq!(
        results.provider("limited").unwrap()[0].kind,
        ResultKind::NotSupported
    );
}

/// Unmarshal failures keep the raw response and stop reason on the record.
#[tokio::test]
async fn unmarshal_error_keeps_raw_response() {
    let adapter = Arc::new(MockProvider::new("garbled", |_| {
        Box::pin(async {
            Err(ProviderError::UnmarshalResponse {
                reason: "trailing words".into(),
                raw: "not json at all".into(),
                stop_reason: Some("length".into()),
            })
        })
    }));
    let runner = runner_for(vec![ProviderEntry {
        name: "garbled".to_string(),
        adapter,
        runs: vec![run_config("default", None)],
    }]);

    let results = runner
        .run(CancellationToken::new(), vec![text_task("t", &["x"])])
        .await
        .unwrap();
    let result = &results.provider("garbled").unwrap()[0];
    assert_eq!(result.kind, ResultKind::Error);
    let error = result.details.error.as_ref().unwrap();
    assert_eq!(error.raw_response.as_deref(), Some("not json at all"));
    assert_eq!(error.stop_reason.as_deref(), Some("length"));
}

/// A panicking adapter is recovered into an Error result and the batch
/// continues.
#[tokio::test]
async fn panics_are_recovered_as_errors() {
    let adapter = Arc::new(MockProvider::new("panicky", |call| {
        Box::pin(async move {
            if call.task_name == "bad" {
                panic!("scripted panic");
            }
            Ok(response(call.expected[0].clone()))
        })
    }));
    let runner = runner_for(vec![ProviderEntry {
        name: "panicky".to_string(),
        adapter,
        runs: vec![run_config("default", None)],
    }]);

    let results = runner
        .run(
            CancellationToken::new(),
            vec![text_task("bad", &["x"]), text_task("good", &["x"])],
        )
        .await
        .unwrap();

    let provider_results = results.provider("panicky").unwrap();
    assert_eq!(provider_results[0].kind, ResultKind::Error);
    assert!(provider_results[0].got.contains("panic"));
    assert_eq!(provider_results[1].kind, ResultKind::Success);
}
