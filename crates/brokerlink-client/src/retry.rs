//! Retry Logic with Exponential Backoff
//!
//! Used by background metadata refreshes and by admin topic listings, which retry
//! until the caller's timeout. The producer runs its own loop (it tracks attempts
//! per pending send) but takes its backoff from the same policy. The consumer
//! retries group and offset requests on its next poll instead.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_retries: 3            │
//! │  - initial_backoff: 100ms    │
//! │  - max_backoff: 10s          │
//! │  - backoff_multiplier: 2.0   │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait ~100ms (jittered)
//!        ├─→ Attempt 3: Wait ~200ms
//!        └─→ Attempt 4: Wait ~400ms
//! ```
//!
//! ## Retryable vs Non-Retryable Errors
//!
//! Classification comes from [`ClientError::is_retryable`]:
//!
//! **Retryable**: connection failures, broker timeouts, stale leadership or
//! coordinator routing, rebalances, missing metadata.
//!
//! **Non-retryable**: unknown topics or partitions, invalid arguments, configuration
//! errors, offsets out of range, closed handles.
//!
//! ## Deadlines
//!
//! [`retry_with_deadline`] never sleeps past the caller's deadline. When the next
//! backoff would overrun it, the last error is returned instead of waiting.
//!
//! ## Examples
//!
//! ```ignore
//! use brokerlink_client::retry::{RetryPolicy, retry_with_jittered_backoff};
//!
//! let policy = RetryPolicy::default();
//!
//! let offsets = retry_with_jittered_backoff(&policy, || async {
//!     fetch_committed(&group).await
//! }).await?;
//! ```

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Retry policy configuration for exponential backoff.
///
/// # Backoff Calculation
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
///
/// The jittered variant scales that by a random factor in `0.75..1.25` so clients
/// that failed together do not retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    /// 3 retries, 100ms initial backoff, 10s cap, 2x growth.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as usize) as i32);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }

    /// [`backoff`](Self::backoff) scaled by a random factor in `0.75..1.25`.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter = 0.75 + (rand::random::<f64>() * 0.5);
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }
}

/// Retry an operation with jittered exponential backoff.
///
/// Stops on success, on a non-retryable error, or once `max_retries` retries have
/// failed, returning the last error.
pub async fn retry_with_jittered_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    retry_with_deadline(policy, None, operation).await
}

/// Like [`retry_with_jittered_backoff`], but gives up instead of sleeping past
/// `deadline`.
pub async fn retry_with_deadline<F, Fut, T>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_retryable() {
                    debug!(error = %error, "Non-retryable error, giving up");
                    return Err(error);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %error,
                        "Max retries exhausted, giving up"
                    );
                    return Err(error);
                }

                let backoff = policy.jittered_backoff(attempt);
                if let Some(deadline) = deadline {
                    if Instant::now() + backoff >= deadline {
                        debug!(error = %error, "Deadline reached, giving up");
                        return Err(error);
                    }
                }

                if matches!(error, ClientError::RebalanceInProgress(_)) {
                    debug!(attempt = attempt + 1, "Rebalance in progress, backing off");
                } else {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Retryable error, backing off with jitter"
                    );
                }

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
        )
    }

    fn unavailable() -> ClientError {
        ClientError::Connection {
            broker: "1".to_string(),
            message: "broker is down".to_string(),
        }
    }

    // ========================================================================
    // RetryPolicy - backoff calculation
    // ========================================================================

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_exponential_growth_default() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10)); // Capped
        assert_eq!(policy.backoff(100), Duration::from_secs(10));
        assert_eq!(policy.backoff(usize::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jittered_backoff_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let backoff = policy.jittered_backoff(1);
            assert!(backoff >= Duration::from_millis(150));
            assert!(backoff <= Duration::from_millis(250));
        }
    }

    // ========================================================================
    // retry loops
    // ========================================================================

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let policy = fast_policy(5);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_jittered_backoff(&policy, || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(unavailable())
                } else {
                    Ok::<i32, ClientError>(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_immediate_fail() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_jittered_backoff(&policy, || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, ClientError>(ClientError::NotFound("topic 'x'".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ClientError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let policy = fast_policy(2);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_jittered_backoff(&policy, || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, ClientError>(unavailable())
            }
        })
        .await;

        assert!(result.is_err());
        // Initial attempt + 2 retries = 3 total
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_deadline() {
        let policy = RetryPolicy::new(
            100,
            Duration::from_millis(20),
            Duration::from_millis(20),
            1.0,
        );
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let deadline = Instant::now() + Duration::from_millis(50);

        let result = retry_with_deadline(&policy, Some(deadline), || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, ClientError>(unavailable())
            }
        })
        .await;

        assert!(result.is_err());
        let made = attempts.load(Ordering::SeqCst);
        assert!((1..=4).contains(&made), "made {} attempts", made);
    }

    #[tokio::test]
    async fn test_retry_actually_waits() {
        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(20),
            Duration::from_millis(100),
            2.0,
        );
        let start = std::time::Instant::now();

        let _ = retry_with_jittered_backoff(&policy, || async {
            Err::<i32, ClientError>(unavailable())
        })
        .await;

        // 15ms + 30ms minimum with jitter
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
