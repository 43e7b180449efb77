//! Call timeouts and bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use bridge_core::{RetryConfig, TierError, TierResult};
use tokio::sync::watch;

/// Bound an adapter call. An elapsed timeout is a transient failure.
pub async fn call_with_timeout<T, F>(timeout: Duration, fut: F) -> TierResult<T>
where
    F: Future<Output = TierResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TierError::Timeout {
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub backoff: RetryConfig,
    /// Wait one backoff step before the first attempt as well.
    pub delay_first: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: RetryConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            delay_first: false,
        }
    }

    pub fn delayed(mut self) -> Self {
        self.delay_first = true;
        self
    }

    fn delay_before(&self, attempt: u32) -> Option<Duration> {
        match (attempt, self.delay_first) {
            (1, false) => None,
            (1, true) => Some(self.backoff.backoff_for(1)),
            (n, false) => Some(self.backoff.backoff_for(n - 1)),
            (n, true) => Some(self.backoff.backoff_for(n)),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// Retries ran out, or the error was permanent.
    Exhausted { error: TierError, attempts: u32 },
    /// Shutdown was signalled while waiting between attempts.
    Cancelled { attempts: u32 },
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `op` receives the 1-based attempt number. When `shutdown` is given, a
/// shutdown signal ends the loop during a backoff wait.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut shutdown: Option<watch::Receiver<bool>>,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TierResult<T>>,
{
    let mut last_error = TierError::transient("no attempt made");
    for attempt in 1..=policy.max_attempts {
        if let Some(delay) = policy.delay_before(attempt) {
            if !wait(delay, shutdown.as_mut()).await {
                return RetryOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }
        }

        match op(attempt).await {
            Ok(value) => return RetryOutcome::Succeeded { value, attempts: attempt },
            Err(error) if !error.is_retryable() => {
                return RetryOutcome::Exhausted {
                    error,
                    attempts: attempt,
                }
            }
            Err(error) => {
                tracing::debug!(attempt, error = %error, "Retryable tier failure");
                last_error = error;
            }
        }
    }
    RetryOutcome::Exhausted {
        error: last_error,
        attempts: policy.max_attempts,
    }
}

/// Sleep for `delay`. Returns false if shutdown was signalled first.
async fn wait(delay: Duration, shutdown: Option<&mut watch::Receiver<bool>>) -> bool {
    match shutdown {
        None => {
            tokio::time::sleep(delay).await;
            true
        }
        Some(rx) => {
            if *rx.borrow() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                changed = rx.changed() => match changed {
                    Ok(()) => !*rx.borrow(),
                    Err(_) => false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            RetryConfig {
                initial_backoff_millis: 1,
                max_backoff_millis: 2,
                backoff_multiplier: 2.0,
            },
        )
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let result: TierResult<()> = call_with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(TierError::Timeout { after_ms: 5 }));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = retry(&fast(5), None, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(TierError::transient("reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(
            outcome,
            RetryOutcome::Succeeded {
                value: 3,
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let outcome: RetryOutcome<()> = retry(&fast(5), None, |_| async {
            Err(TierError::permanent("too large"))
        })
        .await;
        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let outcome: RetryOutcome<()> = retry(&fast(3), None, |attempt| async move {
            Err(TierError::transient(format!("attempt {attempt}")))
        })
        .await;
        match outcome {
            RetryOutcome::Exhausted { error, attempts } => {
                assert_eq!(attempts, 3);
                assert!(error.to_string().contains("attempt 3"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_backoff() {
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy::new(
            3,
            RetryConfig {
                initial_backoff_millis: 60_000,
                max_backoff_millis: 60_000,
                backoff_multiplier: 1.0,
            },
        );
        let handle = tokio::spawn(async move {
            retry(&policy, Some(rx), |_| async {
                Err::<(), _>(TierError::transient("down"))
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, RetryOutcome::Cancelled { attempts: 1 });
    }

    #[test]
    fn test_delay_schedule() {
        let policy = fast(4);
        assert_eq!(policy.delay_before(1), None);
        assert_eq!(policy.delay_before(2), Some(Duration::from_millis(1)));
        let delayed = fast(4).delayed();
        assert_eq!(delayed.delay_before(1), Some(Duration::from_millis(1)));
        assert_eq!(delayed.delay_before(3), Some(Duration::from_millis(2)));
    }
}
