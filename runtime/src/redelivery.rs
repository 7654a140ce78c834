//! Bounded redelivery with exponential backoff.
//!
//! Retryable failures (an unknown rider whose signup has not arrived yet, a
//! storage outage, a timed-out task) are attempted again up to
//! [`RedeliveryPolicy::max_attempts`] times in total. What happens after the
//! last attempt is the policy's [`FinalDisposition`].
//!
//! # Example
//!
//! ```rust
//! use loyalty_runtime::redelivery::{FinalDisposition, RedeliveryPolicy};
//! use std::time::Duration;
//!
//! let policy = RedeliveryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .exhausted(FinalDisposition::Park)
//!     .build();
//!
//! // The first delivery is immediate.
//! assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
//! assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
//! ```

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;

/// What to do with an event whose last attempt failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FinalDisposition {
    /// Log at error level and drop.
    #[default]
    Drop,
    /// Store in the dead-letter sink.
    Park,
}

impl FromStr for FinalDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "park" => Ok(Self::Park),
            other => Err(format!("unknown disposition '{other}', expected drop or park")),
        }
    }
}

impl fmt::Display for FinalDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drop => "drop",
            Self::Park => "park",
        })
    }
}

/// Redelivery configuration.
///
/// # Default Values
///
/// - `max_attempts`: 2 (first delivery plus one redelivery)
/// - `initial_delay`: 500ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
/// - `exhausted`: [`FinalDisposition::Drop`]
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap for exponential backoff
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`
    pub jitter: bool,
    /// Disposition after the last attempt fails
    pub exhausted: FinalDisposition,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RedeliveryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder {
            max_attempts: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
            exhausted: FinalDisposition::Drop,
        }
    }

    /// Delay to wait before `attempt` (1-based).
    ///
    /// Attempt 1 is the original delivery and has no delay. Afterwards:
    /// `initial_delay * multiplier ^ (attempt - 2)`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2).min(64) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    #[must_use]
    pub const fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn sleep_duration(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }
}

/// Builder for [`RedeliveryPolicy`].
#[derive(Debug, Clone)]
pub struct RedeliveryPolicyBuilder {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    exhausted: FinalDisposition,
}

impl RedeliveryPolicyBuilder {
    /// Set total attempts (at least 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Set the delay before the second attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the final disposition.
    #[must_use]
    pub const fn exhausted(mut self, disposition: FinalDisposition) -> Self {
        self.exhausted = disposition;
        self
    }

    /// Build the [`RedeliveryPolicy`].
    #[must_use]
    pub const fn build(self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
            exhausted: self.exhausted,
        }
    }
}

/// Result of running an operation under a [`RedeliveryPolicy`].
#[derive(Debug)]
pub struct Attempted<T, E> {
    /// Final result.
    pub result: Result<T, E>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
///
/// `operation` receives the 1-based attempt number.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RedeliveryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Attempted<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(attempt, error = %err, "Error is not retryable, failing immediately");
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                    };
                }

                if !policy.allows_retry_after(attempt) {
                    tracing::warn!(attempt, error = %err, "Operation failed after max attempts");
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                    };
                }

                attempt += 1;
                let delay = policy.sleep_duration(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

/// [`retry_with_predicate`] over [`LoyaltyError::is_retryable`](loyalty_core::LoyaltyError::is_retryable).
///
/// # Errors
///
/// The last error once attempts run out, or the first non-retryable one.
pub async fn retry_transient<F, Fut, T>(
    policy: &RedeliveryPolicy,
    operation: F,
) -> Result<T, loyalty_core::LoyaltyError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, loyalty_core::LoyaltyError>>,
{
    retry_with_predicate(policy, operation, loyalty_core::LoyaltyError::is_retryable)
        .await
        .result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use loyalty_core::LoyaltyError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RedeliveryPolicy {
        RedeliveryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    #[test]
    fn default_policy_tries_twice_then_drops() {
        let policy = RedeliveryPolicy::default();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.exhausted, FinalDisposition::Drop);
        assert!(policy.allows_retry_after(1));
        assert!(!policy.allows_retry_after(2));
    }

    #[test]
    fn delay_calculation() {
        let policy = RedeliveryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RedeliveryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        let policy = RedeliveryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .jitter(true)
            .build();
        for _ in 0..50 {
            let delay = policy.sleep_duration(2);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RedeliveryPolicy::builder().max_attempts(0).build().max_attempts, 1);
    }

    #[test]
    fn dispositions_parse() {
        assert_eq!("drop".parse(), Ok(FinalDisposition::Drop));
        assert_eq!("PARK".parse(), Ok(FinalDisposition::Park));
        assert!("retry".parse::<FinalDisposition>().is_err());
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = retry_with_predicate(
            &fast(3),
            |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(LoyaltyError::Persistence("blip".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            LoyaltyError::is_retryable,
        )
        .await;

        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = retry_with_predicate(
            &fast(2),
            |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LoyaltyError::Persistence("down".into())) }
            },
            LoyaltyError::is_retryable,
        )
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_transient(&fast(5), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(LoyaltyError::Validation("bad".into())) }
        })
        .await;

        assert!(matches!(result, Err(LoyaltyError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
