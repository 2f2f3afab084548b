//! Worker pipeline: claim, transfer, report.
//!
//! Each worker task loops over: wait out a pause, claim the next queued
//! item, pass the rate limiter, invoke the engine, and route the outcome
//! back through the item store and the notification surface. Workers hold
//! no queue locks while suspended; all shared state lives behind the store's
//! own critical section.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EngineError, FetchOutcome, FetchRequest, MediaEngine, TransferProgress};
use crate::events::{EventBus, QueueEvent};
use crate::session::SessionTracker;
use crate::store::{ItemStatus, ItemStore, QueueItem};

use super::limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy};

/// Shared dependencies cloned into every worker task.
pub(super) struct WorkerContext {
    pub store: Arc<ItemStore>,
    pub sessions: Arc<SessionTracker>,
    pub engine: Arc<dyn MediaEngine>,
    pub events: EventBus,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
    pub jitter: Option<(std::time::Duration, std::time::Duration)>,
    pub shutdown: CancellationToken,
    pub active: Arc<dashmap::DashMap<u64, ActiveHandle>>,
}

/// Control handle for one in-flight transfer.
///
/// Registered in the coordinator's active map for the duration of the
/// attempt, so `cancel`, `pause`, and `stop` can reach the owning worker.
#[derive(Debug, Clone)]
pub(crate) struct ActiveHandle {
    cancel: CancellationToken,
    pause_requested: Arc<AtomicBool>,
    user_cancelled: Arc<AtomicBool>,
}

impl ActiveHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause_requested: Arc::new(AtomicBool::new(false)),
            user_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Interrupts the transfer so the item parks as `Paused`.
    pub(crate) fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Cancels the transfer on behalf of the user.
    pub(crate) fn request_cancel(&self) {
        self.user_cancelled.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Cancels the transfer for pool shutdown (sessions are retained).
    pub(crate) fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    fn user_cancelled(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst)
    }
}

/// Main loop for one worker slot.
pub(super) async fn run_worker(
    ctx: Arc<WorkerContext>,
    mut paused: watch::Receiver<bool>,
    slot: usize,
) {
    debug!(slot, "worker started");
    loop {
        if wait_until_unpaused(&ctx, &mut paused).await.is_err() {
            break;
        }

        let Some(item) = ctx.store.claim_next_or_wait(&ctx.shutdown).await else {
            break;
        };

        ctx.events.emit(QueueEvent::StatusChanged {
            id: item.id,
            from: ItemStatus::Queued,
            to: ItemStatus::Active,
        });
        debug!(slot, item_id = item.id, attempt = item.attempt_count, "item claimed");

        process_item(&ctx, item).await;
    }
    debug!(slot, "worker exited");
}

/// Parks while the pool is paused. Returns `Err(())` on shutdown.
async fn wait_until_unpaused(
    ctx: &WorkerContext,
    paused: &mut watch::Receiver<bool>,
) -> Result<(), ()> {
    loop {
        if ctx.shutdown.is_cancelled() {
            return Err(());
        }
        if !*paused.borrow() {
            return Ok(());
        }
        tokio::select! {
            () = ctx.shutdown.cancelled() => return Err(()),
            changed = paused.changed() => {
                if changed.is_err() {
                    return Err(());
                }
            }
        }
    }
}

/// Runs one claimed item through a single attempt and routes the outcome.
#[instrument(skip(ctx, item), fields(item_id = item.id, locator = %item.source_locator))]
async fn process_item(ctx: &Arc<WorkerContext>, item: QueueItem) {
    let handle = ActiveHandle::new();
    ctx.active.insert(item.id, handle.clone());

    let result = run_attempt(ctx, &item, &handle).await;

    ctx.active.remove(&item.id);

    match result {
        Ok(outcome) => finish_success(ctx, &item, &outcome).await,
        Err(EngineError::Cancelled) => finish_cancelled(ctx, &item, &handle).await,
        Err(error) => finish_failure(ctx, &item, &error).await,
    }
}

/// One dispatch attempt: rate limiting, optional probe, then the transfer.
async fn run_attempt(
    ctx: &Arc<WorkerContext>,
    item: &QueueItem,
    handle: &ActiveHandle,
) -> Result<FetchOutcome, EngineError> {
    ctx.limiter.acquire().await;
    if let Some((min, max)) = ctx.jitter {
        ctx.limiter.jitter(min, max).await;
    }

    // First attempt resolves metadata so the UI has a title and an expected
    // size before bytes start flowing. Retries skip the probe.
    if item.attempt_count == 1 {
        let metadata = ctx
            .engine
            .probe(&item.source_locator, &item.custom_options)
            .await?;
        if let Some(updated) = ctx.store.apply_metadata(item.id, &metadata) {
            ctx.events.emit(QueueEvent::Progress {
                id: item.id,
                bytes_downloaded: updated.bytes_downloaded,
                bytes_total: updated.bytes_total,
                fraction: updated.progress_fraction(),
            });
        }
    }

    // Resume markers are keyed by item id, but a record inherited from a
    // previous run may still be keyed by locator if the rebind has not
    // landed yet.
    let resume = match ctx.sessions.load(item.id).await {
        Some(record) => Some(record.markers()),
        None => ctx
            .sessions
            .find_by_locator(&item.source_locator)
            .await
            .map(|record| record.markers()),
    };

    let (progress_tx, progress_rx) = watch::channel(TransferProgress::default());
    let bridge = spawn_progress_bridge(
        Arc::clone(ctx),
        item.id,
        item.source_locator.clone(),
        progress_rx,
    );

    let request = FetchRequest {
        locator: item.source_locator.clone(),
        options: item.custom_options.clone(),
        resume,
        progress: progress_tx,
        cancel: handle.cancel.clone(),
    };

    // The select guards against engines that ignore the token; dropping the
    // fetch future also drops the progress sender, unblocking the bridge.
    let result = tokio::select! {
        biased;

        () = handle.cancel.cancelled() => Err(EngineError::Cancelled),

        result = ctx.engine.fetch(request) => result,
    };

    // Let the bridge flush the last progress tick and resume markers before
    // the outcome transition, so observers never see them out of order.
    if let Err(join_error) = bridge.await {
        warn!(item_id = item.id, error = %join_error, "progress bridge panicked");
    }

    result
}

/// Relays engine progress into the store, the session tracker, and the
/// notification surface. Exits when the engine drops its sender; the final
/// update is flushed to the session tracker so an interruption can resume.
fn spawn_progress_bridge(
    ctx: Arc<WorkerContext>,
    item_id: u64,
    locator: String,
    mut rx: watch::Receiver<TransferProgress>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seq = 0u64;
        while rx.changed().await.is_ok() {
            let progress = rx.borrow_and_update().clone();
            if progress.seq == last_seq {
                continue;
            }
            last_seq = progress.seq;

            let Some(updated) =
                ctx.store
                    .update_progress(item_id, progress.bytes_downloaded, progress.bytes_total)
            else {
                continue;
            };
            ctx.events.emit(QueueEvent::Progress {
                id: item_id,
                bytes_downloaded: updated.bytes_downloaded,
                bytes_total: updated.bytes_total,
                fraction: updated.progress_fraction(),
            });
            ctx.sessions
                .save(
                    item_id,
                    &locator,
                    &progress.resume_markers,
                    progress.bytes_downloaded,
                    progress.bytes_total,
                )
                .await;
        }

        let last = rx.borrow().clone();
        if last.seq > 0 && !last.resume_markers.is_null() {
            ctx.sessions
                .flush(
                    item_id,
                    &locator,
                    &last.resume_markers,
                    last.bytes_downloaded,
                    last.bytes_total,
                )
                .await;
        }
    })
}

async fn finish_success(ctx: &Arc<WorkerContext>, item: &QueueItem, outcome: &FetchOutcome) {
    let _ = ctx
        .store
        .update_progress(item.id, outcome.bytes_downloaded, outcome.bytes_total);
    match ctx.store.update_status(item.id, ItemStatus::Completed) {
        Ok(Some((from, updated))) => {
            info!(item_id = item.id, bytes = outcome.bytes_downloaded, "download completed");
            ctx.events.emit(QueueEvent::StatusChanged {
                id: item.id,
                from,
                to: ItemStatus::Completed,
            });
            ctx.events.emit(QueueEvent::Progress {
                id: item.id,
                bytes_downloaded: updated.bytes_downloaded,
                bytes_total: updated.bytes_total,
                fraction: 1.0,
            });
            ctx.events.emit(QueueEvent::Completed { id: item.id });
        }
        Ok(None) => debug!(item_id = item.id, "item removed before completion"),
        Err(error) => warn!(item_id = item.id, error = %error, "could not mark item completed"),
    }
    ctx.sessions.clear_item(item.id, &item.source_locator).await;
}

async fn finish_cancelled(ctx: &Arc<WorkerContext>, item: &QueueItem, handle: &ActiveHandle) {
    let to = if handle.pause_requested() {
        ItemStatus::Paused
    } else {
        ItemStatus::Cancelled
    };

    match ctx.store.update_status(item.id, to) {
        Ok(Some((from, _))) => {
            info!(item_id = item.id, status = %to, "transfer interrupted");
            ctx.events.emit(QueueEvent::StatusChanged { id: item.id, from, to });
        }
        Ok(None) => debug!(item_id = item.id, "item removed during cancellation"),
        Err(error) => debug!(item_id = item.id, error = %error, "cancellation transition skipped"),
    }

    // Only an explicit per-item cancel discards resume state; pool shutdown
    // keeps sessions so a restart can offer resume, and a pause needs them.
    if handle.user_cancelled() {
        ctx.sessions.clear_item(item.id, &item.source_locator).await;
    }
}

async fn finish_failure(ctx: &Arc<WorkerContext>, item: &QueueItem, error: &EngineError) {
    let reason = error.to_string();
    let decision = ctx.retry.decide(error.retryable(), item.attempt_count);
    let will_retry = matches!(decision, RetryDecision::Retry { .. });

    let from = match ctx.store.fail(item.id, &reason, will_retry) {
        Ok(Some((from, _))) => from,
        Ok(None) => {
            debug!(item_id = item.id, "item removed before failure handling");
            return;
        }
        Err(store_error) => {
            debug!(item_id = item.id, error = %store_error, "failure transition skipped");
            return;
        }
    };
    ctx.events.emit(QueueEvent::StatusChanged {
        id: item.id,
        from,
        to: ItemStatus::Failed,
    });

    match decision {
        RetryDecision::Retry { delay, attempt } => {
            // A server-mandated wait takes precedence over computed backoff.
            let delay = error.retry_after().unwrap_or(delay);
            info!(
                item_id = item.id,
                attempt,
                max_attempts = ctx.retry.max_attempts(),
                delay_ms = delay.as_millis(),
                error = %reason,
                "retrying download"
            );
            schedule_requeue(Arc::clone(ctx), item.id, delay);
        }
        RetryDecision::GiveUp { reason: why } => {
            warn!(
                item_id = item.id,
                attempts = item.attempt_count,
                error = %reason,
                %why,
                "download failed terminally"
            );
            ctx.events.emit(QueueEvent::Failed {
                id: item.id,
                reason,
            });
            ctx.sessions.clear_item(item.id, &item.source_locator).await;
        }
    }
}

/// Schedules a `Failed -> Queued` transition after the backoff delay.
///
/// The timer is a spawned task, not a busy wait, and dies with the pool's
/// shutdown token. The transition is skipped silently if the item was
/// cancelled or removed while waiting.
fn schedule_requeue(ctx: Arc<WorkerContext>, item_id: u64, delay: std::time::Duration) {
    tokio::spawn(async move {
        tokio::select! {
            () = ctx.shutdown.cancelled() => {}
            () = tokio::time::sleep(delay) => {
                match ctx.store.update_status(item_id, ItemStatus::Queued) {
                    Ok(Some((from, _))) => {
                        debug!(item_id, "item requeued for retry");
                        ctx.events.emit(QueueEvent::StatusChanged {
                            id: item_id,
                            from,
                            to: ItemStatus::Queued,
                        });
                    }
                    Ok(None) => debug!(item_id, "item removed before retry"),
                    Err(error) => debug!(item_id, error = %error, "retry requeue skipped"),
                }
            }
        }
    });
}
