//! Error types for item store operations.

use thiserror::Error;

use super::item::ItemStatus;

/// Errors that can occur during item store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The locator already has a live (non-settled) entry.
    #[error(
        "duplicate item: '{locator}' is already queued or in flight\n  Suggestion: Cancel or wait for the existing item before resubmitting"
    )]
    DuplicateLocator {
        /// The conflicting locator.
        locator: String,
    },

    /// Queue item not found.
    #[error(
        "queue item not found: id {0}\n  Suggestion: The item may have been removed or the ID is incorrect"
    )]
    ItemNotFound(u64),

    /// The requested status transition is not in the allowed state graph.
    #[error("invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        /// The item whose transition was rejected.
        id: u64,
        /// Status the item currently holds.
        from: ItemStatus,
        /// Status that was requested.
        to: ItemStatus,
    },
}
