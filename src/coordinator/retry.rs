//! Retry policy with exponential backoff for failed downloads.
//!
//! When an attempt fails, the engine error's `retryable` classification and
//! the item's attempt count feed into a [`RetryPolicy`], which decides
//! between scheduling another attempt after a backoff delay and giving the
//! item up as terminally failed.
//!
//! # Example
//!
//! ```
//! use mediaqueue_core::coordinator::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.decide(true, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("attempt {attempt} after {delay:?}");
//!     }
//!     RetryDecision::GiveUp { reason } => {
//!         println!("giving up: {reason}");
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

/// Default maximum dispatch attempts per item (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(64);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Decision on whether to retry a failed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the item after the given delay.
    Retry {
        /// How long to wait before the item re-enters the queue.
        delay: Duration,
        /// Which attempt number the retry will be.
        attempt: u32,
    },

    /// Finalize the item as terminally failed.
    GiveUp {
        /// Human-readable reason why no retry is attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) [+ jitter]
/// ```
///
/// With defaults, the delay after attempt `n` is 2s, 4s, 8s, ... capped at
/// 64s. Jitter is opt-in via [`RetryPolicy::with_jitter`]; without it the
/// delay sequence is deterministic and non-decreasing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    /// Base delay for the first retry.
    base_delay: Duration,
    /// Delay cap.
    max_delay: Duration,
    /// Multiplier applied each attempt.
    multiplier: f64,
    /// Upper bound of random jitter added to each delay, when enabled.
    jitter: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier,
            jitter: None,
        }
    }

    /// Creates a policy with a custom attempt cap and default backoff.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Enables random jitter up to `max_jitter` on every computed delay,
    /// desynchronizing retries across items that failed together.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.jitter = Some(max_jitter);
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether a failed item is retried.
    ///
    /// # Arguments
    ///
    /// * `retryable` - The engine error's classification
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn decide(&self, retryable: bool, attempt: u32) -> RetryDecision {
        if !retryable {
            return RetryDecision::GiveUp {
                reason: "failure is not retryable".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::GiveUp {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.next_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Computes the backoff delay after the given failed attempt.
    ///
    /// Capped at the configured maximum; jitter, when enabled, is added on
    /// top of the capped value.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        match self.jitter {
            Some(max_jitter) if max_jitter > Duration::ZERO => {
                #[allow(clippy::cast_possible_truncation)]
                let bound = max_jitter.as_millis() as u64;
                let jitter_ms = rand::thread_rng().gen_range(0..=bound);
                Duration::from_millis(jitter_ms)
            }
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Policy Construction ====================

    #[test]
    fn test_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(64));
        assert!(policy.jitter.is_none());
    }

    #[test]
    fn test_max_attempts_minimum_is_one() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts(), 1);
    }

    // ==================== Delay Calculation ====================

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(64), 2.0);
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        // 1 * 2^5 = 32s, capped at 5s
        assert_eq!(policy.next_delay(6), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_non_decreasing_without_jitter() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_within_bounds() {
        let max_jitter = Duration::from_millis(500);
        let policy = RetryPolicy::default().with_jitter(max_jitter);
        let base = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.next_delay(1);
            let floor = base.next_delay(1);
            assert!(delay >= floor);
            assert!(delay <= floor + max_jitter);
        }
    }

    // ==================== Decision ====================

    #[test]
    fn test_non_retryable_gives_up_immediately() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(false, 1);
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
        if let RetryDecision::GiveUp { reason } = decision {
            assert!(reason.contains("not retryable"));
        }
    }

    #[test]
    fn test_retryable_retries_with_next_attempt_number() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(true, 1);
        assert!(
            matches!(decision, RetryDecision::Retry { attempt: 2, delay } if delay > Duration::ZERO)
        );
    }

    #[test]
    fn test_respects_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(3);

        assert!(matches!(policy.decide(true, 1), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(true, 2), RetryDecision::Retry { .. }));

        let decision = policy.decide(true, 3);
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
        if let RetryDecision::GiveUp { reason } = decision {
            assert!(reason.contains("exhausted"));
        }
    }

    #[test]
    fn test_delays_grow_across_decisions() {
        let policy = RetryPolicy::with_max_attempts(5);
        let d1 = policy.decide(true, 1);
        let d2 = policy.decide(true, 2);
        if let (
            RetryDecision::Retry { delay: first, .. },
            RetryDecision::Retry { delay: second, .. },
        ) = (d1, d2)
        {
            assert!(second > first);
        } else {
            panic!("expected both decisions to retry");
        }
    }

    #[test]
    fn test_default_max_attempts_constant() {
        assert_eq!(DEFAULT_MAX_ATTEMPTS, 3);
    }
}
