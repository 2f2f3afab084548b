//! Coordinator configuration and validation.

use std::time::Duration;

use thiserror::Error;

use crate::coordinator::RetryPolicy;

/// Minimum allowed worker pool size.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed worker pool size.
pub const MAX_CONCURRENCY: usize = 5;

/// Default worker pool size if not specified.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default minimum interval between session persistence writes per item.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Error type for configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Jitter range with `min > max`.
    #[error("invalid jitter range: min {min_ms}ms exceeds max {max_ms}ms")]
    InvalidJitter {
        /// Lower bound in milliseconds.
        min_ms: u128,
        /// Upper bound in milliseconds.
        max_ms: u128,
    },
}

/// Sliding-window rate limit settings, shared by all workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per window. `0` disables rate limiting.
    pub max_requests: usize,
    /// Length of the sliding window.
    pub window: Duration,
}

impl RateLimitConfig {
    /// A configuration that disables rate limiting entirely.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_requests: 0,
            window: Duration::from_secs(60),
        }
    }

    /// Whether this configuration disables rate limiting.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_requests == 0
    }
}

impl Default for RateLimitConfig {
    /// 30 requests per minute, matching typical extractor-friendly pacing.
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Configuration for a [`crate::coordinator::DownloadCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Number of concurrent worker slots (1-5).
    pub concurrency: usize,
    /// Retry/backoff policy for failed items.
    pub retry: RetryPolicy,
    /// Sliding-window admission control for engine calls.
    pub rate_limit: RateLimitConfig,
    /// Optional random delay range applied before each transfer, to
    /// desynchronize concurrent workers.
    pub jitter: Option<(Duration, Duration)>,
    /// Minimum interval between session persistence writes per item.
    pub persist_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            jitter: None,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
        }
    }
}

impl CoordinatorConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConcurrency`] if the pool size is
    /// outside `1..=5`, or [`ConfigError::InvalidJitter`] for an inverted
    /// jitter range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency {
                value: self.concurrency,
            });
        }
        if let Some((min, max)) = self.jitter {
            if min > max {
                return Err(ConfigError::InvalidJitter {
                    min_ms: min.as_millis(),
                    max_ms: max.as_millis(),
                });
            }
        }
        Ok(())
    }
}
