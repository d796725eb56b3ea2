//! Per-run execution wrapper: rate limiting and retry with backoff.
//!
//! One [`RunExecutor`] exists per run variant. Its token-bucket limiter is
//! shared by every task call of that run (and by nothing else); the retry
//! loop consumes attempts only on transient errors.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::{ProviderError, ProviderResponse, RetryPolicy, RunConfig};

/// Wraps provider calls of one run variant with throttling and retry.
pub struct RunExecutor {
    limiter: Option<DefaultDirectRateLimiter>,
    retry: Option<RetryPolicy>,
}

impl RunExecutor {
    /// Builds the executor for one run. A `max_rpm` of zero disables the
    /// limiter; the bucket's burst equals the per-minute budget.
    pub fn new(run: &RunConfig) -> Self {
        let limiter = NonZeroU32::new(run.max_rpm)
            .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)));
        Self {
            limiter,
            retry: run.retry,
        }
    }

    /// Executes one provider call under this run's policies.
    ///
    /// `call` receives the 1-based attempt number and is invoked at most
    /// `max_attempts + 1` times; `on_retry(attempt, delay)` fires before each
    /// backoff sleep. Cancellation interrupts limiter waits and backoff
    /// sleeps without consuming an attempt and surfaces as
    /// [`ProviderError::Cancelled`].
    pub async fn execute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
        mut on_retry: impl FnMut(u32, Duration),
    ) -> Result<ProviderResponse, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ProviderResponse, ProviderError>>,
    {
        let max_retries = self.retry.map(|r| r.max_attempts).unwrap_or(0);
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            self.acquire(cancel).await?;

            match call(attempt).await {
                Ok(mut response) => {
                    if attempt > 1 {
                        response
                            .explanation
                            .push_str(&format!("\n\nAnswer produced after {attempt} attempts."));
                    }
                    return Ok(response);
                }
                Err(error) if error.is_retryable() && attempt <= max_retries => {
                    // delay = initial * 2^(retry - 1)
                    let policy = self.retry.expect("retries imply a policy");
                    let delay = policy.initial_delay * 2u32.saturating_pow(attempt - 1);
                    debug!(attempt, ?delay, error = %error, "transient error, backing off");
                    on_retry(attempt, delay);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Waits for a rate-limit slot, observing cancellation.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        tokio::select! {
            _ = limiter.until_ready() => Ok(()),
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ModelParams;
    use crate::provider::mock::response;
    use crate::task::AnswerPayload;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn run_config(max_rpm: u32, retry: Option<RetryPolicy>) -> RunConfig {
        RunConfig {
            name: "r".into(),
            model: "m".into(),
            max_rpm,
            retry,
            params: ModelParams::default(),
        }
    }

    fn ok_response() -> ProviderResponse {
        response(AnswerPayload::Text("ok".into()))
    }

    #[tokio::test]
    async fn succeeds_without_policy() {
        let executor = RunExecutor::new(&run_config(0, None));
        let calls = AtomicU32::new(0);
        let result = executor
            .execute(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(ok_response()) }
                },
                |_, _| {},
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_consume_attempts_then_succeed() {
        let executor = RunExecutor::new(&run_config(
            0,
            Some(RetryPolicy {
                max_attempts: 4,
                initial_delay: Duration::from_millis(1),
            }),
        ));
        let calls = AtomicU32::new(0);
        let retries = AtomicU32::new(0);

        let result = executor
            .execute(
                &CancellationToken::new(),
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(ProviderError::Retryable("flaky".into()))
                        } else {
                            Ok(ok_response())
                        }
                    }
                },
                |_, _| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert!(result.explanation.contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let executor = RunExecutor::new(&run_config(
            0,
            Some(RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
            }),
        ));
        let calls = AtomicU32::new(0);

        let error = executor
            .execute(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<ProviderResponse, _>(ProviderError::Retryable("down".into())) }
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        // initial + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(error.to_string().contains("transient"));
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let executor = RunExecutor::new(&run_config(
            0,
            Some(RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(1),
            }),
        ));
        let calls = AtomicU32::new(0);

        let error = executor
            .execute(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<ProviderResponse, _>(ProviderError::ApiResponse {
                            status: 401,
                            body: "bad key".into(),
                        })
                    }
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(error, ProviderError::ApiResponse { .. }));
    }

    #[tokio::test]
    async fn backoff_doubles_per_retry() {
        let executor = RunExecutor::new(&run_config(
            0,
            Some(RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(2),
            }),
        ));
        let delays = std::sync::Mutex::new(Vec::new());

        let _ = executor
            .execute(
                &CancellationToken::new(),
                |_| async { Err::<ProviderResponse, _>(ProviderError::Retryable("x".into())) },
                |_, delay| delays.lock().unwrap().push(delay),
            )
            .await;

        assert_eq!(
            *delays.lock().unwrap(),
            vec![
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(8),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let executor = RunExecutor::new(&run_config(
            0,
            Some(RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_secs(60),
            }),
        ));
        let cancel = CancellationToken::new();
        let child = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let error = executor
            .execute(
                &cancel,
                |_| async { Err::<ProviderResponse, _>(ProviderError::Retryable("x".into())) },
                |_, _| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn limiter_throttles_beyond_burst() {
        // 60 rpm: burst of 60, then one token per second.
        let executor = RunExecutor::new(&run_config(60, None));
        let cancel = CancellationToken::new();

        let start = std::time::Instant::now();
        for _ in 0..60 {
            executor.acquire(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(500), "burst should not block");
    }
}
