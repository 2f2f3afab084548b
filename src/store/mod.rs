//! In-memory item store: the single source of truth for queue state.
//!
//! The store owns every [`QueueItem`] for its whole lifecycle
//! (queued → active → completed/failed/cancelled) and is the only piece of
//! mutable state shared between the scheduler, its workers, and callers.
//! All mutating operations run under one exclusive critical section, so
//! status transitions and progress counters are always observed atomically
//! and in order.
//!
//! # Dispatch
//!
//! Workers obtain items through [`ItemStore::claim_next`], which selects the
//! highest-priority queued item (insertion order breaks ties), transitions it
//! to `Active`, and bumps its attempt counter — all inside the critical
//! section. Two concurrent claimers can therefore never receive the same
//! item. [`ItemStore::claim_next_or_wait`] parks on a notify that fires
//! whenever an item enters `Queued`.
//!
//! # State machine
//!
//! ```text
//! Queued -> Active -> Completed          (terminal, success)
//! Queued -> Active -> Failed -> Queued   (retry scheduled)
//! Queued -> Active -> Failed             (terminal, retries exhausted)
//! Active -> Paused -> Queued
//! any non-settled -> Cancelled           (terminal, user-initiated)
//! ```

mod error;
mod item;

pub use error::StoreError;
pub use item::{ItemStatus, QueueItem};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::engine::MediaMetadata;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Per-status counts for a queue snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub queued: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StoreCounts {
    /// Total number of items tracked.
    #[must_use]
    pub fn total(&self) -> usize {
        self.queued + self.active + self.paused + self.completed + self.failed + self.cancelled
    }
}

/// Thread-safe, insertion-ordered store of queue items.
///
/// Designed to be wrapped in `Arc` and shared between the coordinator,
/// its workers, and snapshot readers.
#[derive(Debug, Default)]
pub struct ItemStore {
    /// Items in insertion order (adjusted by `reorder`). Queue sizes are
    /// small enough that linear scans beat a secondary index.
    items: Mutex<Vec<QueueItem>>,
    /// Signalled whenever an item transitions into `Queued`.
    queued: Notify,
    /// Monotonic id source; ids are never reused.
    next_id: AtomicU64,
}

impl ItemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        // A poisoned lock only means another thread panicked mid-update;
        // the store's invariants hold per-item, so continue with the data.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a new item in `Queued` status and returns a clone of it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateLocator`] if the locator already has a
    /// non-settled entry. A settled entry (completed, cancelled, or
    /// terminally failed) does not block resubmission; the new request gets
    /// a fresh item and id.
    #[instrument(skip(self, custom_options), fields(locator = %source_locator))]
    pub fn add(
        &self,
        source_locator: &str,
        priority: i64,
        custom_options: Value,
    ) -> Result<QueueItem> {
        let mut items = self.lock();

        if items
            .iter()
            .any(|item| item.source_locator == source_locator && !item.is_settled())
        {
            return Err(StoreError::DuplicateLocator {
                locator: source_locator.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let item = QueueItem::new(id, source_locator.to_string(), priority, custom_options);
        items.push(item.clone());
        drop(items);

        debug!(item_id = id, "item added");
        self.queued.notify_waiters();
        Ok(item)
    }

    /// Returns a clone of the item with the given id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<QueueItem> {
        self.lock().iter().find(|item| item.id == id).cloned()
    }

    /// Removes an item regardless of status and returns it.
    ///
    /// Callers are responsible for cancelling the owning worker first when
    /// the item is `Active`; the store itself does no signalling.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] if no item exists with the id.
    #[instrument(skip(self))]
    pub fn remove(&self, id: u64) -> Result<QueueItem> {
        let mut items = self.lock();
        let index = items
            .iter()
            .position(|item| item.id == id)
            .ok_or(StoreError::ItemNotFound(id))?;
        Ok(items.remove(index))
    }

    /// Atomically transitions an item to a new status.
    ///
    /// Returns `Ok(None)` (a no-op) when the item does not exist — a worker
    /// finishing an item that was removed concurrently is not an error.
    /// On success returns the previous status and a clone of the updated
    /// item, for event emission.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the transition is not in
    /// the allowed state graph.
    #[instrument(skip(self))]
    pub fn update_status(
        &self,
        id: u64,
        new_status: ItemStatus,
    ) -> Result<Option<(ItemStatus, QueueItem)>> {
        let mut items = self.lock();
        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            return Ok(None);
        };

        let from = item.status;
        if !transition_allowed(item, new_status) {
            return Err(StoreError::InvalidTransition {
                id,
                from,
                to: new_status,
            });
        }

        item.status = new_status;
        match new_status {
            ItemStatus::Queued => item.retry_pending = false,
            ItemStatus::Completed => {
                // A finished transfer with an unknown total is complete by
                // definition; pin the total so the fraction reads 1.0.
                if item.bytes_total.is_none() {
                    item.bytes_total = Some(item.bytes_downloaded);
                }
            }
            ItemStatus::Cancelled => item.retry_pending = false,
            ItemStatus::Active | ItemStatus::Paused | ItemStatus::Failed => {}
        }
        let updated = item.clone();
        drop(items);

        if new_status == ItemStatus::Queued {
            self.queued.notify_waiters();
        }
        Ok(Some((from, updated)))
    }

    /// Transitions an item to `Failed`, recording the failure reason and
    /// whether a retry has been scheduled, in one critical section.
    ///
    /// Semantics otherwise match [`ItemStore::update_status`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the item is not `Active`.
    #[instrument(skip(self, reason))]
    pub fn fail(
        &self,
        id: u64,
        reason: &str,
        retry_pending: bool,
    ) -> Result<Option<(ItemStatus, QueueItem)>> {
        let mut items = self.lock();
        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            return Ok(None);
        };

        let from = item.status;
        if !transition_allowed(item, ItemStatus::Failed) {
            return Err(StoreError::InvalidTransition {
                id,
                from,
                to: ItemStatus::Failed,
            });
        }

        item.status = ItemStatus::Failed;
        item.last_error = Some(reason.to_string());
        item.retry_pending = retry_pending;
        Ok(Some((from, item.clone())))
    }

    /// Claims the next dispatchable item, if any.
    ///
    /// Selects the `Queued` item with the highest priority (insertion order
    /// breaks ties), transitions it to `Active`, and increments its attempt
    /// counter — atomically, so concurrent claimers never obtain the same
    /// item.
    #[must_use]
    pub fn claim_next(&self) -> Option<QueueItem> {
        let mut items = self.lock();

        let index = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == ItemStatus::Queued)
            .max_by(|(index_a, a), (index_b, b)| {
                // Higher priority wins; earlier insertion wins among equals.
                a.priority.cmp(&b.priority).then(index_b.cmp(index_a))
            })
            .map(|(index, _)| index)?;

        let item = &mut items[index];
        item.status = ItemStatus::Active;
        item.attempt_count += 1;
        Some(item.clone())
    }

    /// Claims the next dispatchable item, waiting until one becomes
    /// available or the shutdown token fires.
    ///
    /// Returns `None` on shutdown. The wait itself holds no lock.
    pub async fn claim_next_or_wait(&self, shutdown: &CancellationToken) -> Option<QueueItem> {
        loop {
            // Register interest before checking, so a notify that lands
            // between the check and the await is not lost.
            let notified = self.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.claim_next() {
                return Some(item);
            }

            tokio::select! {
                () = shutdown.cancelled() => return None,
                () = &mut notified => {}
            }
        }
    }

    /// Updates transfer progress for an item.
    ///
    /// Progress is only meaningful while the item is owned by a worker, so
    /// this is a no-op (returning `None`) for items in any other status —
    /// a late progress tick can never contradict a terminal transition.
    pub fn update_progress(
        &self,
        id: u64,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    ) -> Option<QueueItem> {
        let mut items = self.lock();
        let item = items.iter_mut().find(|item| item.id == id)?;
        if !matches!(item.status, ItemStatus::Active | ItemStatus::Paused) {
            return None;
        }
        item.bytes_downloaded = bytes_downloaded;
        if bytes_total.is_some() {
            item.bytes_total = bytes_total;
        }
        Some(item.clone())
    }

    /// Applies probe metadata (title, expected size) to an item.
    pub fn apply_metadata(&self, id: u64, metadata: &MediaMetadata) -> Option<QueueItem> {
        let mut items = self.lock();
        let item = items.iter_mut().find(|item| item.id == id)?;
        if metadata.title.is_some() {
            item.title.clone_from(&metadata.title);
        }
        if metadata.bytes_total.is_some() {
            item.bytes_total = metadata.bytes_total;
        }
        Some(item.clone())
    }

    /// Repositions an item within the insertion-ordered sequence.
    ///
    /// Only affects the tiebreak among equal-priority queued items; priority
    /// always dominates dispatch order. Indices beyond the end clamp to the
    /// end.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] if no item exists with the id.
    #[instrument(skip(self))]
    pub fn reorder(&self, id: u64, new_index: usize) -> Result<()> {
        let mut items = self.lock();
        let current = items
            .iter()
            .position(|item| item.id == id)
            .ok_or(StoreError::ItemNotFound(id))?;
        let item = items.remove(current);
        let target = new_index.min(items.len());
        items.insert(target, item);
        Ok(())
    }

    /// Returns clones of all items in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.lock().clone()
    }

    /// Returns clones of all items with the given status, in insertion order.
    #[must_use]
    pub fn get_by_status(&self, status: ItemStatus) -> Vec<QueueItem> {
        self.lock()
            .iter()
            .filter(|item| item.status == status)
            .cloned()
            .collect()
    }

    /// Returns per-status counts.
    #[must_use]
    pub fn counts(&self) -> StoreCounts {
        let items = self.lock();
        let mut counts = StoreCounts::default();
        for item in items.iter() {
            match item.status {
                ItemStatus::Queued => counts.queued += 1,
                ItemStatus::Active => counts.active += 1,
                ItemStatus::Paused => counts.paused += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Cancels every non-settled item, returning the previous status and a
    /// clone of each item that changed. Used by pool shutdown.
    pub fn cancel_non_settled(&self) -> Vec<(ItemStatus, QueueItem)> {
        let mut items = self.lock();
        let mut changed = Vec::new();
        for item in items.iter_mut() {
            if !item.is_settled() {
                let from = item.status;
                item.status = ItemStatus::Cancelled;
                item.retry_pending = false;
                changed.push((from, item.clone()));
            }
        }
        changed
    }

    /// Removes all settled items, returning how many were dropped.
    pub fn clear_settled(&self) -> usize {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|item| !item.is_settled());
        before - items.len()
    }

    /// Number of items currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true when no items are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Checks the allowed state graph for a requested transition.
fn transition_allowed(item: &QueueItem, to: ItemStatus) -> bool {
    use ItemStatus::{Active, Cancelled, Completed, Failed, Paused, Queued};
    match (item.status, to) {
        (Queued, Active)
        | (Active, Completed | Failed | Paused)
        | (Failed | Paused, Queued) => true,
        (_, Cancelled) => !item.is_settled(),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn add(store: &ItemStore, locator: &str) -> QueueItem {
        store.add(locator, 0, Value::Null).unwrap()
    }

    // ==================== Add / Duplicate Tests ====================

    #[test]
    fn test_add_assigns_increasing_ids() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let b = add(&store, "https://example.com/v/b");
        assert!(b.id > a.id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_add_rejects_live_duplicate_locator() {
        let store = ItemStore::new();
        add(&store, "https://example.com/v/a");
        let result = store.add("https://example.com/v/a", 0, Value::Null);
        assert!(matches!(result, Err(StoreError::DuplicateLocator { .. })));
    }

    #[test]
    fn test_add_allows_resubmit_after_settled() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let claimed = store.claim_next().unwrap();
        assert_eq!(claimed.id, a.id);
        store.update_status(a.id, ItemStatus::Completed).unwrap();

        // Completed entry no longer blocks; resubmission creates a new item.
        let b = store.add("https://example.com/v/a", 0, Value::Null).unwrap();
        assert_ne!(b.id, a.id);
        assert_eq!(b.status, ItemStatus::Queued);
    }

    #[test]
    fn test_add_rejects_duplicate_while_retry_pending() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        store.claim_next().unwrap();
        store.fail(a.id, "transient", true).unwrap();

        let result = store.add("https://example.com/v/a", 0, Value::Null);
        assert!(matches!(result, Err(StoreError::DuplicateLocator { .. })));
    }

    // ==================== Transition Tests ====================

    #[test]
    fn test_update_status_missing_item_is_noop() {
        let store = ItemStore::new();
        let result = store.update_status(999, ItemStatus::Cancelled).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_update_status_rejects_queued_to_completed() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let result = store.update_status(a.id, ItemStatus::Completed);
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: ItemStatus::Queued,
                to: ItemStatus::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_completed_item_is_never_redispatched() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        store.claim_next().unwrap();
        store.update_status(a.id, ItemStatus::Completed).unwrap();

        assert!(store.claim_next().is_none());
        let result = store.update_status(a.id, ItemStatus::Queued);
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn test_cancel_settled_item_rejected() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        store.claim_next().unwrap();
        store.update_status(a.id, ItemStatus::Completed).unwrap();

        let result = store.update_status(a.id, ItemStatus::Cancelled);
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn test_cancel_allowed_from_every_non_settled_status() {
        for setup in [ItemStatus::Queued, ItemStatus::Active, ItemStatus::Paused] {
            let store = ItemStore::new();
            let a = add(&store, "https://example.com/v/a");
            if setup != ItemStatus::Queued {
                store.claim_next().unwrap();
            }
            if setup == ItemStatus::Paused {
                store.update_status(a.id, ItemStatus::Paused).unwrap();
            }
            let (from, item) = store
                .update_status(a.id, ItemStatus::Cancelled)
                .unwrap()
                .unwrap();
            assert_eq!(from, setup);
            assert_eq!(item.status, ItemStatus::Cancelled);
        }
    }

    #[test]
    fn test_failed_retry_cycle_resets_retry_pending() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        store.claim_next().unwrap();
        let (_, failed) = store.fail(a.id, "timeout", true).unwrap().unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert!(failed.retry_pending);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        let (_, requeued) = store
            .update_status(a.id, ItemStatus::Queued)
            .unwrap()
            .unwrap();
        assert!(!requeued.retry_pending);
        assert_eq!(requeued.status, ItemStatus::Queued);
    }

    #[test]
    fn test_paused_requeue_cycle() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        store.claim_next().unwrap();
        store.update_status(a.id, ItemStatus::Paused).unwrap();
        store.update_status(a.id, ItemStatus::Queued).unwrap();

        let reclaimed = store.claim_next().unwrap();
        assert_eq!(reclaimed.id, a.id);
        assert_eq!(reclaimed.attempt_count, 2);
    }

    // ==================== Claim / Ordering Tests ====================

    #[test]
    fn test_claim_next_fifo_among_equal_priority() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let b = add(&store, "https://example.com/v/b");

        assert_eq!(store.claim_next().unwrap().id, a.id);
        assert_eq!(store.claim_next().unwrap().id, b.id);
        assert!(store.claim_next().is_none());
    }

    #[test]
    fn test_claim_next_priority_precedes_insertion_order() {
        let store = ItemStore::new();
        let low = store.add("https://example.com/v/low", 0, Value::Null).unwrap();
        let high = store
            .add("https://example.com/v/high", 10, Value::Null)
            .unwrap();

        assert_eq!(store.claim_next().unwrap().id, high.id);
        assert_eq!(store.claim_next().unwrap().id, low.id);
    }

    #[test]
    fn test_claim_increments_attempt_count() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let claimed = store.claim_next().unwrap();
        assert_eq!(claimed.attempt_count, 1);

        store.fail(a.id, "transient", true).unwrap();
        store.update_status(a.id, ItemStatus::Queued).unwrap();
        let reclaimed = store.claim_next().unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exactly_once() {
        let store = Arc::new(ItemStore::new());
        for i in 0..50 {
            store
                .add(&format!("https://example.com/v/{i}"), 0, Value::Null)
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(item) = store.claim_next() {
                    claimed.push(item.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 50, "every item claimed exactly once");

        let total_attempts: u32 = store.snapshot().iter().map(|i| i.attempt_count).sum();
        assert_eq!(total_attempts, 50, "one attempt per dispatch");
    }

    #[tokio::test]
    async fn test_claim_next_or_wait_wakes_on_add() {
        let store = Arc::new(ItemStore::new());
        let shutdown = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { store.claim_next_or_wait(&shutdown).await })
        };

        tokio::task::yield_now().await;
        let added = add(&store, "https://example.com/v/a");

        let claimed = waiter.await.unwrap().unwrap();
        assert_eq!(claimed.id, added.id);
    }

    #[tokio::test]
    async fn test_claim_next_or_wait_returns_none_on_shutdown() {
        let store = Arc::new(ItemStore::new());
        let shutdown = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { store.claim_next_or_wait(&shutdown).await })
        };

        tokio::task::yield_now().await;
        shutdown.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    // ==================== Progress / Metadata Tests ====================

    #[test]
    fn test_update_progress_only_while_owned() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");

        // Queued items do not accept progress.
        assert!(store.update_progress(a.id, 10, Some(100)).is_none());

        store.claim_next().unwrap();
        let updated = store.update_progress(a.id, 10, Some(100)).unwrap();
        assert_eq!(updated.bytes_downloaded, 10);
        assert_eq!(updated.bytes_total, Some(100));

        store.update_status(a.id, ItemStatus::Completed).unwrap();
        assert!(store.update_progress(a.id, 50, Some(100)).is_none());
    }

    #[test]
    fn test_completed_with_unknown_total_pins_total() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        store.claim_next().unwrap();
        store.update_progress(a.id, 777, None);
        let (_, item) = store
            .update_status(a.id, ItemStatus::Completed)
            .unwrap()
            .unwrap();
        assert_eq!(item.bytes_total, Some(777));
        assert!((item.progress_fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_metadata_sets_title_and_total() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let metadata = MediaMetadata {
            title: Some("A Video".to_string()),
            duration_secs: Some(120),
            bytes_total: Some(4096),
        };
        let updated = store.apply_metadata(a.id, &metadata).unwrap();
        assert_eq!(updated.title.as_deref(), Some("A Video"));
        assert_eq!(updated.bytes_total, Some(4096));
    }

    // ==================== Reorder / Snapshot Tests ====================

    #[test]
    fn test_snapshot_reflects_insertion_order() {
        let store = ItemStore::new();
        let ids: Vec<u64> = (0..5)
            .map(|i| add(&store, &format!("https://example.com/v/{i}")).id)
            .collect();
        let snapshot_ids: Vec<u64> = store.snapshot().iter().map(|item| item.id).collect();
        assert_eq!(snapshot_ids, ids);
    }

    #[test]
    fn test_reorder_moves_item_to_front() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let b = add(&store, "https://example.com/v/b");
        let c = add(&store, "https://example.com/v/c");

        store.reorder(c.id, 0).unwrap();
        let order: Vec<u64> = store.snapshot().iter().map(|item| item.id).collect();
        assert_eq!(order, vec![c.id, a.id, b.id]);

        // Dispatch now follows the new tiebreak order.
        assert_eq!(store.claim_next().unwrap().id, c.id);
    }

    #[test]
    fn test_reorder_clamps_to_end() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let b = add(&store, "https://example.com/v/b");

        store.reorder(a.id, 99).unwrap();
        let order: Vec<u64> = store.snapshot().iter().map(|item| item.id).collect();
        assert_eq!(order, vec![b.id, a.id]);
    }

    #[test]
    fn test_reorder_missing_item() {
        let store = ItemStore::new();
        assert!(matches!(
            store.reorder(1, 0),
            Err(StoreError::ItemNotFound(1))
        ));
    }

    // ==================== Bulk Operation Tests ====================

    #[test]
    fn test_cancel_non_settled_spares_settled_items() {
        let store = ItemStore::new();
        let done = add(&store, "https://example.com/v/done");
        store.claim_next().unwrap();
        store.update_status(done.id, ItemStatus::Completed).unwrap();

        let queued = add(&store, "https://example.com/v/queued");
        let active = add(&store, "https://example.com/v/active");
        store.claim_next().unwrap(); // claims `queued` (FIFO)

        let changed = store.cancel_non_settled();
        let changed_ids: Vec<u64> = changed.iter().map(|(_, item)| item.id).collect();
        assert!(changed_ids.contains(&queued.id));
        assert!(changed_ids.contains(&active.id));
        assert!(!changed_ids.contains(&done.id));

        assert_eq!(store.get(done.id).unwrap().status, ItemStatus::Completed);
    }

    #[test]
    fn test_clear_settled_removes_only_settled() {
        let store = ItemStore::new();
        let done = add(&store, "https://example.com/v/done");
        store.claim_next().unwrap();
        store.update_status(done.id, ItemStatus::Completed).unwrap();
        let live = add(&store, "https://example.com/v/live");

        assert_eq!(store.clear_settled(), 1);
        let remaining: Vec<u64> = store.snapshot().iter().map(|item| item.id).collect();
        assert_eq!(remaining, vec![live.id]);
    }

    #[test]
    fn test_counts() {
        let store = ItemStore::new();
        add(&store, "https://example.com/v/a");
        add(&store, "https://example.com/v/b");
        store.claim_next().unwrap();

        let counts = store.counts();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn test_remove_returns_item() {
        let store = ItemStore::new();
        let a = add(&store, "https://example.com/v/a");
        let removed = store.remove(a.id).unwrap();
        assert_eq!(removed.id, a.id);
        assert!(store.is_empty());
        assert!(matches!(
            store.remove(a.id),
            Err(StoreError::ItemNotFound(_))
        ));
    }
}
