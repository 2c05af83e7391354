//! Bounded exponential backoff for transient send failures.
//!
//! The producer retries a send only while the client reports a transient
//! condition (a full local queue). Any other failure is returned at once.
//!
//! With `max_retries = r` an operation runs at most `r + 1` times with `r`
//! sleeps between them, doubling from `initial_delay`. The cumulative wait
//! before giving up is therefore `initial_delay × (2^r − 1)`.
//!
//! # Example
//!
//! ```rust
//! use relaykit_runtime::retry::{RetryError, RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(10))
//!     .build();
//!
//! let result = retry_with_predicate(
//!     &policy,
//!     || async { Err::<(), _>("queue full") },
//!     |err: &&str| *err == "queue full",
//! )
//! .await;
//!
//! assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
//! # }
//! ```

use relaykit_core::{Config, DEFAULT_RETRY_BACKOFF};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Upper bound on a single backoff sleep.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Doubling backoff for transient failures.
///
/// Defaults to a single attempt and a 500ms initial delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
        }
    }

    /// The producer policy for a config: its clamped retry budget and its
    /// initial backoff.
    #[must_use]
    pub fn for_producer(config: &Config) -> Self {
        Self::builder()
            .max_retries(usize::from(config.max_producer_retries()))
            .initial_delay(config.retry_backoff())
            .build()
    }

    /// Delay before retry number `attempt` (0-based): `initial_delay × 2^attempt`,
    /// capped at [`MAX_RETRY_DELAY`].
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        u32::try_from(attempt)
            .ok()
            .and_then(|n| 1_u32.checked_shl(n))
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The operation failed with an error that is not retryable
    Rejected(E),
    /// Every attempt failed with a retryable error
    Exhausted {
        /// Total number of attempts made
        attempts: usize,
        /// The error from the final attempt
        last: E,
    },
}

/// Retry an async operation while `is_retryable` accepts its error.
///
/// Sleeps between attempts are plain `tokio` sleeps on the calling task.
///
/// # Errors
///
/// - [`RetryError::Rejected`] as soon as the operation fails with a
///   non-retryable error
/// - [`RetryError::Exhausted`] once `max_retries` retries have failed
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(error = %err, "Error is not retryable, failing immediately");
                    return Err(RetryError::Rejected(err));
                }

                if attempt >= policy.max_retries {
                    tracing::warn!(
                        attempts = attempt + 1,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_retry_policy_delay_doubles() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
    }

    #[test]
    fn test_retry_policy_delay_is_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .build();

        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(5), MAX_RETRY_DELAY);
        assert_eq!(policy.delay_for_attempt(40), MAX_RETRY_DELAY);
        assert_eq!(policy.delay_for_attempt(usize::MAX), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_policy_follows_config() {
        let cfg = Config::new()
            .with_max_producer_retries(4)
            .with_retry_backoff(Duration::from_millis(50));
        let policy = RetryPolicy::for_producer(&cfg);

        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
    }

    proptest::proptest! {
        #[test]
        fn delays_never_shrink_or_exceed_cap(
            initial_ms in 1_u64..2_000,
            attempt in 0_usize..64,
        ) {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .build();

            let delay = policy.delay_for_attempt(attempt);
            proptest::prop_assert!(delay <= MAX_RETRY_DELAY);
            proptest::prop_assert!(policy.delay_for_attempt(attempt + 1) >= delay);
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_first_try() {
        let counter = Arc::new(AtomicUsize::new(0));

        let result = retry_with_predicate(
            &RetryPolicy::default(),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(42) }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::builder().max_retries(3).build();
        let counter = Arc::new(AtomicUsize::new(0));

        let result = retry_with_predicate(
            &policy,
            || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(format!("Attempt {attempt} failed"))
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_with_full_backoff() {
        let policy = RetryPolicy::builder().max_retries(2).build();
        let counter = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let result = retry_with_predicate(
            &policy,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>("queue full") }
            },
            |_| true,
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: "queue full",
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // 500ms + 1000ms
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_retry_with_predicate_skips_non_retryable() {
        let policy = RetryPolicy::builder().max_retries(5).build();
        let counter = Arc::new(AtomicUsize::new(0));

        let result = retry_with_predicate(
            &policy,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>("permanent error") }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert_eq!(result, Err(RetryError::Rejected("permanent error")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
