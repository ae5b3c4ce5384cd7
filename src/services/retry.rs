//! Exponential backoff with jitter
//!
//! Wraps any fallible async operation whose error reports a retryable flag.
//! Cancellation is deliberately not handled here; callers that need it wrap
//! the operation themselves.

use crate::Result;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: Option<u64>,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms: None,
            jitter: true,
        }
    }
}

/// Delay before retry number `attempt` (0-indexed): `base · 2^attempt`,
/// capped by `max_delay_ms`, multiplied by a uniform factor in [0.75, 1.25)
/// when jitter is on, floored at 1 ms.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponential = policy
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = match policy.max_delay_ms {
        Some(max) => exponential.min(max),
        None => exponential,
    };

    let delay_ms = if policy.jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.75..1.25);
        (capped as f64 * factor) as u64
    } else {
        capped
    };

    Duration::from_millis(delay_ms.max(1))
}

/// Re-invoke `op` on retryable failures, up to `policy.max_retries` retries.
/// Non-retryable errors propagate immediately.
pub async fn retry_backoff<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = backoff_delay(&policy, attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: Some(2),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let result = retry_backoff(quick_policy(3), || async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_backoff(quick_policy(3), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::pipeline_retryable("fetch_metadata", "transient"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_propagate_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_backoff(quick_policy(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::pipeline_fatal("run_asr", "bad request")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_the_budget_returns_the_last_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_backoff(quick_policy(2), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::pipeline_retryable("download_video", "still failing")) }
        })
        .await;

        assert!(result.is_err());
        // 1 initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_doubles_and_respects_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: Some(350),
            jitter: false,
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(350));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds_and_floors_at_one_ms() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 1000,
            max_delay_ms: None,
            jitter: true,
        };
        for _ in 0..100 {
            let delay = backoff_delay(&policy, 0).as_millis() as u64;
            assert!((750..1250).contains(&delay), "delay {delay} out of bounds");
        }

        let tiny = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: Some(1),
            jitter: true,
        };
        for _ in 0..20 {
            assert!(backoff_delay(&tiny, 0) >= Duration::from_millis(1));
        }
    }
}
