//! Sliding-window rate limiting for engine requests.
//!
//! This module provides the [`RateLimiter`] struct which throttles outgoing
//! extraction/download requests to a configured budget of requests per
//! window. The window slides: timestamps older than the window are
//! discarded as they age out, so admission never bursts at fixed window
//! boundaries.
//!
//! One limiter instance is shared by all workers; it carries no per-item
//! state. Its lock is independent of the item store's critical section, so
//! throttling never couples with queue mutation.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mediaqueue_core::coordinator::RateLimiter;
//!
//! # async fn example() {
//! // Budget of 30 requests per minute, shared by all workers
//! let limiter = Arc::new(RateLimiter::new(30, Duration::from_secs(60)));
//!
//! // Blocks the calling worker until the window has room
//! limiter.acquire().await;
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::config::RateLimitConfig;

/// Sliding-window rate limiter shared by all workers.
///
/// `Send + Sync`; wrap in `Arc` and clone the handle into each worker task.
#[derive(Debug)]
pub struct RateLimiter {
    /// Requests admitted per window.
    max_requests: usize,
    /// Length of the sliding window.
    window: Duration,
    /// Whether rate limiting is disabled.
    disabled: bool,
    /// Admission timestamps inside the current window, oldest first.
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per `window`.
    ///
    /// A zero budget is clamped to 1; use [`RateLimiter::disabled`] to turn
    /// limiting off entirely.
    #[must_use]
    #[instrument(fields(window_ms = window.as_millis()))]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        debug!(max_requests, "creating rate limiter");
        Self {
            max_requests: max_requests.max(1),
            window,
            disabled: false,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Creates a disabled limiter that admits everything immediately.
    #[must_use]
    #[instrument]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            max_requests: 0,
            window: Duration::ZERO,
            disabled: true,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Builds a limiter from a [`RateLimitConfig`]; an unlimited config
    /// yields a disabled limiter.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        if config.is_unlimited() {
            Self::disabled()
        } else {
            Self::new(config.max_requests, config.window)
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Blocks until admitting another request stays within the budget, then
    /// records the admission.
    ///
    /// Timestamps that have aged out of the window are pruned on every
    /// call; when the window is full, the caller sleeps exactly until the
    /// oldest admission leaves the window and re-checks.
    pub async fn acquire(&self) {
        if self.disabled {
            return;
        }

        loop {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();

                while admitted
                    .front()
                    .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
                {
                    admitted.pop_front();
                }

                if admitted.len() < self.max_requests {
                    admitted.push_back(now);
                    return;
                }

                // Full window: wait until the oldest admission ages out.
                admitted
                    .front()
                    .map_or(Duration::ZERO, |oldest| (*oldest + self.window).duration_since(now))
            };

            debug!(wait_ms = wait.as_millis(), "rate limit window full");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Sleeps a random duration in `[min, max]` before a network-facing
    /// call, desynchronizing concurrent workers. Returns the applied delay.
    pub async fn jitter(&self, min: Duration, max: Duration) -> Duration {
        let delay = if max <= min {
            min
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let span_ms = (max - min).as_millis() as u64;
            min + Duration::from_millis(rand::thread_rng().gen_range(0..=span_ms))
        };
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}
