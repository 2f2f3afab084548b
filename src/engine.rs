//! Contract for the external download engine.
//!
//! The coordinator delegates all extraction and transfer work to an engine
//! implementing [`MediaEngine`]. The contract is deliberately narrow:
//! a metadata probe, a transfer call with progress reporting and resume
//! support, and a `retryable` classification on every error so the retry
//! policy can distinguish transient network trouble from permanent failures.
//!
//! Locators and per-item options pass through the coordinator untouched;
//! whatever schema the engine expects is its own business.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Metadata returned by a probe, without transferring payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaMetadata {
    /// Display title of the media, when the engine can resolve one.
    pub title: Option<String>,
    /// Duration in seconds, for time-based media.
    pub duration_secs: Option<u64>,
    /// Expected transfer size in bytes, when known up front.
    pub bytes_total: Option<u64>,
}

/// A progress update published by the engine during a transfer.
///
/// Sent through the watch channel in [`FetchRequest::progress`]; the
/// coordinator's bridge task relays updates into the item store and the
/// notification surface, so the engine never blocks on slow observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    /// Bytes transferred so far.
    pub bytes_downloaded: u64,
    /// Total bytes, once the engine knows it.
    pub bytes_total: Option<u64>,
    /// Opaque engine-specific resume token (byte offset, partial-file path,
    /// fragment index, ...). Persisted verbatim by the session tracker.
    pub resume_markers: Value,
    /// Monotonically increasing sequence number for change detection.
    pub seq: u64,
}

/// Everything an engine needs to perform one transfer attempt.
#[derive(Debug)]
pub struct FetchRequest {
    /// The URL or engine-specific locator to fetch.
    pub locator: String,
    /// Per-item options, forwarded verbatim.
    pub options: Value,
    /// Resume markers from a previous interrupted attempt, if any.
    pub resume: Option<Value>,
    /// Channel for progress updates; send via `send_modify` and bump `seq`.
    pub progress: watch::Sender<TransferProgress>,
    /// Cancelled when the item is cancelled, paused mid-transfer, or the
    /// pool shuts down. Engines should abort promptly and return
    /// [`EngineError::Cancelled`].
    pub cancel: CancellationToken,
}

/// Result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Bytes transferred by this attempt.
    pub bytes_downloaded: u64,
    /// Final total size, when known.
    pub bytes_total: Option<u64>,
}

/// Optional engine capabilities the coordinator adapts to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Whether an in-flight transfer can be interrupted by `pause()` and
    /// later resumed from its markers. Engines without this capability let
    /// in-flight transfers run to completion when the pool pauses.
    pub mid_transfer_pause: bool,
}

/// Errors raised by the engine during `probe` or `fetch`.
///
/// Every variant carries a fixed `retryable` classification consulted by
/// the retry policy: network-shaped failures are worth another attempt,
/// extraction and availability failures are not.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Network-level error (DNS, connection reset, TLS, ...).
    #[error("network error fetching {locator}: {message}")]
    Network {
        /// The locator that failed.
        locator: String,
        /// Engine-provided description.
        message: String,
    },

    /// The transfer timed out before completion.
    #[error("timeout fetching {locator}")]
    Timeout {
        /// The locator that timed out.
        locator: String,
    },

    /// The remote host is throttling requests.
    #[error("rate limited fetching {locator}")]
    RateLimited {
        /// The locator that was throttled.
        locator: String,
        /// Server-mandated wait before the next attempt, when provided.
        retry_after: Option<Duration>,
    },

    /// Site metadata could not be extracted; retrying will not help.
    #[error("extraction failed for {locator}: {message}")]
    Extraction {
        /// The locator that failed extraction.
        locator: String,
        /// Engine-provided description.
        message: String,
    },

    /// The media is gone, private, or region-blocked.
    #[error("source unavailable for {locator}: {reason}")]
    Unavailable {
        /// The locator that is unavailable.
        locator: String,
        /// Engine-provided reason.
        reason: String,
    },

    /// Authentication or authorization required to access the resource.
    #[error("authentication required for {locator}")]
    AuthRequired {
        /// The locator requiring authentication.
        locator: String,
    },

    /// Local file system error while writing the payload.
    #[error("IO error writing {path}: {message}")]
    Io {
        /// The file path where the error occurred.
        path: String,
        /// Underlying error description.
        message: String,
    },

    /// The transfer was cancelled through the request's token. Not a
    /// failure; the coordinator maps this to `Cancelled` or `Paused`.
    #[error("transfer cancelled")]
    Cancelled,
}

impl EngineError {
    /// Creates a network error.
    pub fn network(locator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            locator: locator.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(locator: impl Into<String>) -> Self {
        Self::Timeout {
            locator: locator.into(),
        }
    }

    /// Creates a rate-limited error, optionally carrying the server's
    /// requested wait.
    pub fn rate_limited(locator: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            locator: locator.into(),
            retry_after,
        }
    }

    /// Creates an extraction error.
    pub fn extraction(locator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            locator: locator.into(),
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    pub fn unavailable(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// Creates an authentication-required error.
    pub fn auth_required(locator: impl Into<String>) -> Self {
        Self::AuthRequired {
            locator: locator.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// | Variant | Retryable | Rationale |
    /// |---------|-----------|-----------|
    /// | `Network` | yes | Server or route may recover |
    /// | `Timeout` | yes | Transient congestion |
    /// | `RateLimited` | yes | Backs off, then succeeds |
    /// | `Extraction` | no | Same input, same parse failure |
    /// | `Unavailable` | no | Media removed/private |
    /// | `AuthRequired` | no | Retry without credentials is futile |
    /// | `Io` | no | Local filesystem problem |
    /// | `Cancelled` | no | Deliberate |
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// Server-mandated delay before the next attempt, when the failure
    /// carries one. Overrides the computed backoff delay.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// The external download engine consumed by the coordinator.
///
/// Implementations wrap whatever actually performs extraction and transfer.
/// All methods may block for network time; the calling worker task is the
/// suspension point.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Resolves metadata for a locator without transferring payload.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] with the same classification rules as
    /// [`MediaEngine::fetch`].
    async fn probe(&self, locator: &str, options: &Value) -> Result<MediaMetadata, EngineError>;

    /// Performs the transfer, publishing progress through the request's
    /// watch channel and honoring its resume markers and cancellation token.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] when aborted through the token,
    /// or the engine's classified failure otherwise.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, EngineError>;

    /// Advertises optional capabilities. Defaults to none.
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }
}
