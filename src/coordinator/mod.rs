//! Download coordinator: bounded worker pool and scheduling facade.
//!
//! This module ties the pieces together: callers submit locators, a bounded
//! pool of worker tasks claims queued items exactly once, the shared
//! [`RateLimiter`] paces engine calls, the [`RetryPolicy`] decides what
//! happens after failures, and every lifecycle change is reported through
//! the notification surface.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediaqueue_core::{
//!     CoordinatorConfig, Database, DownloadCoordinator, MediaEngine, SessionTracker,
//! };
//!
//! # async fn example(engine: Arc<dyn MediaEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let sessions = Arc::new(SessionTracker::new(db, CoordinatorConfig::default().persist_interval));
//! let coordinator = DownloadCoordinator::start(engine, sessions, CoordinatorConfig::default())?;
//!
//! let id = coordinator.submit("https://example.com/v/1", serde_json::Value::Null).await?;
//! let events = coordinator.subscribe();
//! # let _ = (id, events);
//! # Ok(())
//! # }
//! ```

pub mod limiter;
pub mod retry;
mod worker;

pub use limiter::RateLimiter;
pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryDecision, RetryPolicy};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{ConfigError, CoordinatorConfig};
use crate::engine::MediaEngine;
use crate::events::{EventBus, ObserverGuard, QueueEvent, QueueObserver};
use crate::session::{SessionRecord, SessionTracker};
use crate::store::{ItemStatus, ItemStore, QueueItem, StoreCounts, StoreError};

use worker::{ActiveHandle, WorkerContext, run_worker};

/// Errors returned by [`DownloadCoordinator::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The locator is not a parseable URL.
    #[error("invalid locator '{locator}': {reason}")]
    InvalidLocator {
        /// The rejected input.
        locator: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Custom options must be a JSON object (or null for none).
    #[error("custom options must be a JSON object or null")]
    InvalidOptions,

    /// The locator already has a live queue entry.
    #[error("duplicate item: '{locator}' is already queued or in flight")]
    Duplicate {
        /// The conflicting locator.
        locator: String,
    },

    /// The pool is shutting down; no new items are accepted.
    #[error("coordinator is shutting down; no new items accepted")]
    ShuttingDown,
}

/// Coordinates a bounded pool of download workers over a shared item store.
///
/// One instance per application. All methods take `&self`; the coordinator
/// is designed to be wrapped in `Arc` and shared with the presentation
/// layer.
pub struct DownloadCoordinator {
    store: Arc<ItemStore>,
    sessions: Arc<SessionTracker>,
    events: EventBus,
    engine: Arc<dyn MediaEngine>,
    active: Arc<DashMap<u64, ActiveHandle>>,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
    stopping: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadCoordinator {
    /// Validates the configuration and starts the worker pool.
    ///
    /// Must be called from within a tokio runtime; workers are spawned
    /// immediately and sit idle until items arrive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    #[instrument(skip_all, fields(concurrency = config.concurrency))]
    pub fn start(
        engine: Arc<dyn MediaEngine>,
        sessions: Arc<SessionTracker>,
        config: CoordinatorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        debug!(
            max_attempts = config.retry.max_attempts(),
            rate_limited = !config.rate_limit.is_unlimited(),
            "starting download coordinator"
        );

        let store = Arc::new(ItemStore::new());
        let events = EventBus::new();
        let active: Arc<DashMap<u64, ActiveHandle>> = Arc::new(DashMap::new());
        let (paused, paused_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            sessions: Arc::clone(&sessions),
            engine: Arc::clone(&engine),
            events: events.clone(),
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            retry: config.retry.clone(),
            jitter: config.jitter,
            shutdown: shutdown.clone(),
            active: Arc::clone(&active),
        });

        let workers = (0..config.concurrency)
            .map(|slot| tokio::spawn(run_worker(Arc::clone(&ctx), paused_rx.clone(), slot)))
            .collect();

        Ok(Self {
            store,
            sessions,
            events,
            engine,
            active,
            paused,
            shutdown,
            stopping: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// Submits a locator with default priority.
    ///
    /// # Errors
    ///
    /// See [`DownloadCoordinator::submit_with_priority`].
    pub async fn submit(&self, locator: &str, options: Value) -> Result<u64, SubmitError> {
        self.submit_with_priority(locator, 0, options).await
    }

    /// Submits a locator for download and returns the new item's id.
    ///
    /// Higher-priority items are dispatched first; insertion order breaks
    /// ties. `options` are forwarded to the engine untouched.
    ///
    /// If a previous run left a persisted session for this locator, the
    /// record is rebound to the new item so the transfer resumes instead of
    /// restarting.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::InvalidLocator`] for unparseable input
    /// - [`SubmitError::InvalidOptions`] when options are not an object
    /// - [`SubmitError::Duplicate`] when the locator is already live
    /// - [`SubmitError::ShuttingDown`] after [`DownloadCoordinator::stop`]
    #[instrument(skip(self, options), fields(locator = %locator))]
    pub async fn submit_with_priority(
        &self,
        locator: &str,
        priority: i64,
        options: Value,
    ) -> Result<u64, SubmitError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }

        let locator = locator.trim();
        if let Err(parse_error) = Url::parse(locator) {
            return Err(SubmitError::InvalidLocator {
                locator: locator.to_string(),
                reason: parse_error.to_string(),
            });
        }
        if !matches!(options, Value::Null | Value::Object(_)) {
            return Err(SubmitError::InvalidOptions);
        }

        let item = self
            .store
            .add(locator, priority, options)
            .map_err(|error| match error {
                StoreError::DuplicateLocator { locator } => SubmitError::Duplicate { locator },
                other => {
                    // add() only fails on duplicates today; surface anything
                    // unexpected as a duplicate-shaped rejection.
                    warn!(error = %other, "unexpected store error on add");
                    SubmitError::Duplicate {
                        locator: locator.to_string(),
                    }
                }
            })?;

        info!(item_id = item.id, priority, "item submitted");
        self.events.emit(QueueEvent::ItemAdded { item: item.clone() });

        // Rebind any session a previous process left for this locator, so
        // the first attempt picks up its resume markers. Losing the race
        // against a fast worker degrades to a full restart, nothing worse.
        self.sessions.rebind_locator(locator, item.id).await;

        Ok(item.id)
    }

    /// Cancels an item in any non-settled state.
    ///
    /// Queued and paused items cancel immediately; an active item's worker
    /// is signalled and performs the transition itself. Cancellation
    /// discards the item's persisted session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] for unknown ids and
    /// [`StoreError::InvalidTransition`] for items already settled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: u64) -> Result<(), StoreError> {
        if let Some(handle) = self.active.get(&id) {
            handle.request_cancel();
            return Ok(());
        }

        match self.store.update_status(id, ItemStatus::Cancelled)? {
            Some((from, item)) => {
                info!(item_id = id, "item cancelled");
                self.events.emit(QueueEvent::StatusChanged {
                    id,
                    from,
                    to: ItemStatus::Cancelled,
                });
                self.sessions.clear_item(id, &item.source_locator).await;
                Ok(())
            }
            None => Err(StoreError::ItemNotFound(id)),
        }
    }

    /// Removes an item from the queue entirely, cancelling its worker first
    /// when one owns it. The persisted session is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: u64) -> Result<QueueItem, StoreError> {
        if let Some(handle) = self.active.get(&id) {
            handle.request_cancel();
        }
        let removed = self.store.remove(id)?;
        self.sessions
            .clear_item(id, &removed.source_locator)
            .await;
        Ok(removed)
    }

    /// Repositions an item within the insertion-ordered queue. Only affects
    /// the tiebreak among equal-priority queued items.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] for unknown ids.
    pub fn reorder(&self, id: u64, new_index: usize) -> Result<(), StoreError> {
        self.store.reorder(id, new_index)
    }

    /// Pauses dispatch: no new items are claimed until `resume()`.
    ///
    /// When the engine advertises `mid_transfer_pause`, in-flight transfers
    /// are interrupted and their items park as `Paused` with resume markers
    /// intact; otherwise in-flight transfers run to completion.
    #[instrument(skip(self))]
    pub fn pause(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        info!("pausing downloads");
        let _ = self.paused.send(true);

        if self.engine.capabilities().mid_transfer_pause {
            for entry in self.active.iter() {
                entry.value().request_pause();
            }
        }
    }

    /// Resumes dispatch and requeues every paused item.
    #[instrument(skip(self))]
    pub fn resume(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        info!("resuming downloads");

        for item in self.store.get_by_status(ItemStatus::Paused) {
            match self.store.update_status(item.id, ItemStatus::Queued) {
                Ok(Some((from, _))) => self.events.emit(QueueEvent::StatusChanged {
                    id: item.id,
                    from,
                    to: ItemStatus::Queued,
                }),
                Ok(None) => {}
                Err(error) => debug!(item_id = item.id, error = %error, "resume requeue skipped"),
            }
        }

        let _ = self.paused.send(false);
    }

    /// Whether dispatch is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stops the pool: cancels every non-settled item, shuts down the
    /// workers, and drains them. Afterwards `submit` is rejected.
    ///
    /// Sessions of items that were merely stopped (not individually
    /// cancelled) are retained so a restarted process can offer resume.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping download coordinator");

        // Wake paused workers so they observe the shutdown token.
        let _ = self.paused.send(false);
        self.shutdown.cancel();

        for entry in self.active.iter() {
            entry.value().request_shutdown();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "worker task panicked");
            }
        }

        // Sweep whatever never reached a worker: queued, paused, and
        // failed-awaiting-retry items all become cancelled.
        for (from, item) in self.store.cancel_non_settled() {
            self.events.emit(QueueEvent::StatusChanged {
                id: item.id,
                from,
                to: ItemStatus::Cancelled,
            });
        }

        info!("download coordinator stopped");
    }

    /// Whether `stop()` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Returns a consistent snapshot of all items in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.store.snapshot()
    }

    /// Returns a clone of one item.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<QueueItem> {
        self.store.get(id)
    }

    /// Returns per-status item counts.
    #[must_use]
    pub fn counts(&self) -> StoreCounts {
        self.store.counts()
    }

    /// Drops all settled items from the queue, returning how many were
    /// removed.
    pub fn clear_settled(&self) -> usize {
        self.store.clear_settled()
    }

    /// Subscribes to queue events. Delivery is best-effort: a receiver that
    /// falls behind skips ahead rather than stalling dispatch.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Attaches a callback-style observer on its own task. Dropping the
    /// returned guard detaches it.
    #[must_use]
    pub fn attach_observer(&self, observer: Arc<dyn QueueObserver>) -> ObserverGuard {
        self.events.attach_observer(observer)
    }

    /// Sessions persisted by previous runs, for presenting resume choices.
    /// Records are adopted automatically when their locator is resubmitted.
    pub async fn resumable_sessions(&self) -> Vec<SessionRecord> {
        self.sessions.load_all().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::{EngineError, FetchOutcome, FetchRequest, MediaMetadata};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Engine stub that completes every fetch instantly.
    struct NullEngine;

    #[async_trait]
    impl MediaEngine for NullEngine {
        async fn probe(&self, _: &str, _: &Value) -> Result<MediaMetadata, EngineError> {
            Ok(MediaMetadata::default())
        }

        async fn fetch(&self, _: FetchRequest) -> Result<FetchOutcome, EngineError> {
            Ok(FetchOutcome {
                bytes_downloaded: 0,
                bytes_total: None,
            })
        }
    }

    async fn test_coordinator(config: CoordinatorConfig) -> DownloadCoordinator {
        let db = Database::new_in_memory().await.unwrap();
        let sessions = Arc::new(SessionTracker::new(db, Duration::from_secs(1)));
        DownloadCoordinator::start(Arc::new(NullEngine), sessions, config).unwrap()
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_concurrency() {
        let db = Database::new_in_memory().await.unwrap();
        let sessions = Arc::new(SessionTracker::new(db, Duration::from_secs(1)));
        let config = CoordinatorConfig {
            concurrency: 0,
            ..CoordinatorConfig::default()
        };
        let result = DownloadCoordinator::start(Arc::new(NullEngine), sessions, config);
        assert!(matches!(
            result.err(),
            Some(ConfigError::InvalidConcurrency { value: 0 })
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_locator() {
        let coordinator = test_coordinator(CoordinatorConfig::default()).await;
        let result = coordinator.submit("not a url", Value::Null).await;
        assert!(matches!(result, Err(SubmitError::InvalidLocator { .. })));
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_submit_rejects_non_object_options() {
        let coordinator = test_coordinator(CoordinatorConfig::default()).await;
        let result = coordinator
            .submit("https://example.com/v/1", Value::from(42))
            .await;
        assert!(matches!(result, Err(SubmitError::InvalidOptions)));
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let coordinator = test_coordinator(CoordinatorConfig::default()).await;
        coordinator.stop().await;
        let result = coordinator.submit("https://example.com/v/1", Value::Null).await;
        assert!(matches!(result, Err(SubmitError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_item() {
        let coordinator = test_coordinator(CoordinatorConfig::default()).await;
        let result = coordinator.cancel(999).await;
        assert!(matches!(result, Err(StoreError::ItemNotFound(999))));
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_pause_flag_toggles() {
        let coordinator = test_coordinator(CoordinatorConfig::default()).await;
        assert!(!coordinator.is_paused());
        coordinator.pause();
        assert!(coordinator.is_paused());
        coordinator.resume();
        assert!(!coordinator.is_paused());
        coordinator.stop().await;
    }
}
