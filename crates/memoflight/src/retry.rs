//! Bounded retries with exponential backoff and a hard deadline.
//!
//! The policy wraps a single fallible operation. Transient failures are
//! absorbed here and retried after an exponentially growing delay; only the
//! final classification of the whole sequence is reported to the caller.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::error::{ComputeError, ComputeResult, OperationError};

/// How a single attempt of the wrapped operation ended.
enum AttemptOutcome<T> {
    Success(T),
    Retryable(String),
    Fatal(String),
    TimedOut,
}

/// Retries an operation up to a configured number of attempts.
///
/// The delay before attempt `n + 1` is `backoff_base * 2^(n - 1)`, capped at
/// `max_backoff`. No attempt and no backoff sleep ever runs past the
/// deadline given to [`execute`](Self::execute).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy making at most `max_attempts` attempts.
    pub fn new(max_attempts: u32, backoff_base: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            max_backoff,
        }
    }

    /// Runs `task_gen`-created futures until one succeeds, a fatal error
    /// occurs, the attempts are exhausted, or the deadline passes.
    ///
    /// Each attempt is clamped to the time remaining until `deadline`. A
    /// scheduled retry that would only start after the deadline is skipped
    /// and the whole call fails with [`ComputeError::DeadlineExceeded`].
    pub async fn execute<G, F, T>(&self, deadline: Instant, mut task_gen: G) -> ComputeResult<T>
    where
        G: FnMut() -> F,
        F: Future<Output = Result<T, OperationError>>,
    {
        let mut attempt = 1;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ComputeError::DeadlineExceeded);
            };

            let outcome = match time::timeout(remaining, task_gen()).await {
                Ok(Ok(value)) => AttemptOutcome::Success(value),
                Ok(Err(OperationError::Transient(cause))) => AttemptOutcome::Retryable(cause),
                Ok(Err(OperationError::Fatal(cause))) => AttemptOutcome::Fatal(cause),
                Err(_) => AttemptOutcome::TimedOut,
            };

            let cause = match outcome {
                AttemptOutcome::Success(value) => return Ok(value),
                AttemptOutcome::Fatal(cause) => return Err(ComputeError::OperationFailed(cause)),
                // The attempt consumed the whole remaining budget.
                AttemptOutcome::TimedOut => return Err(ComputeError::DeadlineExceeded),
                AttemptOutcome::Retryable(cause) => cause,
            };

            tracing::debug!(attempt, cause, "Attempt failed with a transient error");
            metric!(counter("retry.attempt") += 1);

            if attempt >= self.max_attempts {
                return Err(ComputeError::RetryExhausted(cause));
            }

            let delay = self.backoff_delay(attempt);
            if Instant::now() + delay >= deadline {
                return Err(ComputeError::DeadlineExceeded);
            }
            time::sleep(delay).await;

            attempt += 1;
        }
    }

    /// The delay to sleep after the `attempt`th failed attempt.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(5))
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_needs_one_attempt() {
        let calls = AtomicUsize::new(0);
        let result = policy()
            .execute(far_deadline(), || {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok::<_, OperationError>(42) }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicUsize::new(0);
        let result = policy()
            .execute(far_deadline(), || {
                let call = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if call == 0 {
                        Err(OperationError::Transient("connection reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: ComputeResult<u32> = policy()
            .execute(far_deadline(), || {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(OperationError::Fatal("bad request".into())) }
            })
            .await;

        assert_eq!(result, Err(ComputeError::OperationFailed("bad request".into())));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_exponential_and_bounded() {
        let attempt_times = Arc::new(std::sync::Mutex::new(Vec::new()));

        let times = Arc::clone(&attempt_times);
        let result: ComputeResult<u32> = policy()
            .execute(far_deadline(), move || {
                times.lock().unwrap().push(Instant::now());
                async { Err(OperationError::Transient("still down".into())) }
            })
            .await;

        assert_eq!(result, Err(ComputeError::RetryExhausted("still down".into())));

        // Three attempts, delayed by 100ms and then 200ms. No fourth attempt.
        let times = attempt_times.lock().unwrap();
        assert_eq!(times.len(), 3);
        assert_eq!(times[1] - times[0], Duration::from_millis(100));
        assert_eq!(times[2] - times[1], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_clamped_to_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let result: ComputeResult<u32> = policy()
            .execute(deadline, || std::future::pending())
            .await;

        assert_eq!(result, Err(ComputeError::DeadlineExceeded));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_past_deadline_is_skipped() {
        let calls = AtomicUsize::new(0);
        // The second backoff (200ms) would start the third attempt past the
        // deadline, so only two attempts run.
        let deadline = Instant::now() + Duration::from_millis(150);
        let result: ComputeResult<u32> = policy()
            .execute(deadline, || {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(OperationError::Transient("still down".into())) }
            })
            .await;

        assert_eq!(result, Err(ComputeError::DeadlineExceeded));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
