//! Notification surface: queue events for observers.
//!
//! The coordinator reports item lifecycle changes through a broadcast
//! channel. Emission never blocks the scheduler: sends are fire-and-forget,
//! and a slow subscriber lags and drops old events rather than stalling
//! dispatch. Callback-style consumers attach through [`QueueObserver`],
//! which runs on its own task, decoupled from the workers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::store::{ItemStatus, QueueItem};

/// Default capacity of the event channel. Subscribers further behind than
/// this lose the oldest events (best-effort delivery).
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A lifecycle event emitted by the coordinator.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A new item entered the queue.
    ItemAdded {
        /// Snapshot of the item as added.
        item: QueueItem,
    },
    /// An item moved between statuses.
    StatusChanged {
        /// The item that changed.
        id: u64,
        /// Status before the transition.
        from: ItemStatus,
        /// Status after the transition.
        to: ItemStatus,
    },
    /// Transfer progress for an active item.
    Progress {
        /// The item making progress.
        id: u64,
        /// Bytes transferred so far.
        bytes_downloaded: u64,
        /// Total bytes, when known.
        bytes_total: Option<u64>,
        /// Fraction in `[0.0, 1.0]`.
        fraction: f64,
    },
    /// An item finished successfully.
    Completed {
        /// The completed item.
        id: u64,
    },
    /// An item failed terminally.
    Failed {
        /// The failed item.
        id: u64,
        /// Human-readable failure reason, suitable for display.
        reason: String,
    },
}

/// Callback-style event consumer.
///
/// Implementations must not assume they see every event: delivery is
/// best-effort and lagging observers skip ahead.
pub trait QueueObserver: Send + Sync {
    /// Called for each delivered event, on the observer's own task.
    fn on_event(&self, event: &QueueEvent);
}

/// Guard for an attached observer. Dropping it detaches the observer.
#[derive(Debug)]
pub struct ObserverGuard {
    handle: JoinHandle<()>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Broadcast-based event bus shared by the coordinator and its workers.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self { tx }
    }

    /// Creates a new subscription starting from the current event.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Emits an event to all current subscribers. Never blocks; an event
    /// with no subscribers is simply dropped.
    pub(crate) fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    /// Spawns a task that drains a subscription into the observer.
    pub(crate) fn attach_observer(&self, observer: Arc<dyn QueueObserver>) -> ObserverGuard {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => observer.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "observer lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        ObserverGuard { handle }
    }
}
