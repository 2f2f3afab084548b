//! Queue item types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be dispatched to a worker.
    Queued,
    /// Owned by exactly one worker; transfer in flight.
    Active,
    /// Interrupted mid-transfer; re-enters `Queued` on resume.
    Paused,
    /// Successfully downloaded.
    Completed,
    /// Failed; terminal once no retry is pending.
    Failed,
    /// Cancelled by the user or by pool shutdown.
    Cancelled,
}

impl ItemStatus {
    /// Returns the canonical string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for statuses from which no transition is ever allowed.
    ///
    /// `Failed` is not included here: a failed item may still have a retry
    /// pending. Use [`QueueItem::is_settled`] to check whether a specific
    /// item has reached the end of its lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid item status: {s}")),
        }
    }
}

/// A single item in the download queue.
///
/// Items are owned exclusively by the [`crate::store::ItemStore`]; workers
/// and callers only ever see clones taken inside the store's critical
/// section, so a snapshot is always internally consistent.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    /// Unique identifier, stable across retries.
    pub id: u64,
    /// The requested URL or engine-specific locator.
    pub source_locator: String,
    /// Current lifecycle status.
    pub status: ItemStatus,
    /// Higher priority items dispatched first (default 0); insertion order
    /// is the tiebreak among equal priorities.
    pub priority: i64,
    /// Number of dispatch attempts made so far. Incremented exactly once
    /// per claim, monotonically.
    pub attempt_count: u32,
    /// Bytes transferred so far.
    pub bytes_downloaded: u64,
    /// Expected total bytes when known.
    pub bytes_total: Option<u64>,
    /// Display title, filled in from probe metadata when available.
    pub title: Option<String>,
    /// Human-readable reason for the most recent failure.
    pub last_error: Option<String>,
    /// True while a retry has been scheduled and the item is waiting to
    /// re-enter `Queued`. A `Failed` item with no pending retry is settled.
    pub retry_pending: bool,
    /// Per-item overrides forwarded to the engine verbatim. Opaque to the
    /// coordinator.
    pub custom_options: Value,
}

impl QueueItem {
    pub(crate) fn new(id: u64, source_locator: String, priority: i64, custom_options: Value) -> Self {
        Self {
            id,
            source_locator,
            status: ItemStatus::Queued,
            priority,
            attempt_count: 0,
            bytes_downloaded: 0,
            bytes_total: None,
            title: None,
            last_error: None,
            retry_pending: false,
            custom_options,
        }
    }

    /// Returns true once the item has reached the end of its lifecycle:
    /// completed, cancelled, or failed with no retry pending.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        match self.status {
            ItemStatus::Completed | ItemStatus::Cancelled => true,
            ItemStatus::Failed => !self.retry_pending,
            ItemStatus::Queued | ItemStatus::Active | ItemStatus::Paused => false,
        }
    }

    /// Fraction downloaded in `[0.0, 1.0]`.
    ///
    /// Returns 1.0 for completed items and 0.0 while the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_fraction(&self) -> f64 {
        if self.status == ItemStatus::Completed {
            return 1.0;
        }
        match self.bytes_total {
            Some(total) if total > 0 => {
                (self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, locator: {}, status: {} }}",
            self.id, self.source_locator, self.status
        )
    }
}
