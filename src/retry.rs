//! Bounded retry helper used by the stream handshake.
//!
//! The helpers in this module are transport-agnostic. Flowdock connections
//! retry immediately, without backoff.

use std::future::Future;
use tracing::debug;

/// Policy controlling how many times an operation is attempted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
}

impl RetryPolicy {
    /// One initial attempt followed by `retries` immediate retries.
    pub fn immediate(retries: usize) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
        }
    }

    /// Builds an immediate policy from a caller-supplied retry budget.
    ///
    /// Negative budgets mean "no retries" rather than an error.
    pub fn from_budget(retries: i64) -> Self {
        Self::immediate(usize::try_from(retries).unwrap_or(0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(0)
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                debug!(event = "retry_attempt_failed", attempt, max_attempts);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{retry_async, RetryPolicy};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime")
    }

    #[test]
    fn negative_budget_normalizes_to_single_attempt() {
        assert_eq!(RetryPolicy::from_budget(-5).max_attempts, 1);
        assert_eq!(RetryPolicy::from_budget(0).max_attempts, 1);
        assert_eq!(RetryPolicy::from_budget(3).max_attempts, 4);
    }

    #[test]
    fn retries_until_success() {
        runtime().block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let result = retry_async(
                &RetryPolicy::immediate(3),
                {
                    let calls = Arc::clone(&calls);
                    move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            let value = calls.fetch_add(1, Ordering::SeqCst);
                            if value < 2 {
                                Err("retry")
                            } else {
                                Ok("ok")
                            }
                        }
                    }
                },
                |_| true,
            )
            .await;

            assert_eq!(result.expect("success"), "ok");
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn gives_up_after_budget_is_spent() {
        runtime().block_on(async {
            let mut seen = Vec::new();
            let result: Result<(), usize> = retry_async(
                &RetryPolicy::immediate(2),
                |attempt| {
                    seen.push(attempt);
                    async move { Err(attempt) }
                },
                |_| true,
            )
            .await;

            assert_eq!(result.expect_err("exhausted"), 3);
            assert_eq!(seen, vec![1, 2, 3]);
        });
    }

    #[test]
    fn stops_when_retry_predicate_rejects() {
        runtime().block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let result: Result<(), &str> = retry_async(
                &RetryPolicy::immediate(5),
                {
                    let calls = Arc::clone(&calls);
                    move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err("fatal")
                        }
                    }
                },
                |_| false,
            )
            .await;

            assert_eq!(result.expect_err("expected failure"), "fatal");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }
}
