//! Bounded retry with exponential backoff for external service calls

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Retry policy for calls to the recognition, language-model and synthesis
/// services
///
/// `max_attempts` counts the first call, so `1` disables retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy that performs exactly one attempt
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Compute the delay before the next attempt.
///
/// Exponential backoff: `min(base_delay * 2^attempt + jitter, max_delay)`.
/// Jitter is 0-25% of the computed delay, derived from `SystemTime` to avoid
/// pulling in a random number generator.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
///
/// Cancellation is checked before every attempt and during backoff sleeps;
/// a cancelled token yields [`Error::Cancelled`].
///
/// # Errors
///
/// Returns the last error from `op`, or [`Error::Cancelled`]
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = op() => r,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = delay_for_attempt(policy, attempt);
                tracing::warn!(
                    call = what,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "external call failed, retrying"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn transient() -> Error {
        Error::Status {
            status: 503,
            body: "busy".to_string(),
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };

        let first = delay_for_attempt(&policy, 0);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(125));

        assert_eq!(delay_for_attempt(&policy, 10), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_limit() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = with_retry(&fast_policy(3), &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(2), &cancel, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err(transient()) } else { Ok(n) } }
        })
        .await
        .unwrap();

        assert_eq!(result, 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = with_retry(&fast_policy(3), &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Generation("bad model".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Generation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> =
            with_retry(&RetryPolicy::default(), &cancel, "test", || async { Ok(()) }).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
