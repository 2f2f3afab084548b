//! Resumable session tracking.
//!
//! The session tracker persists each in-flight item's opaque resume markers
//! so an interrupted transfer can continue instead of restarting — across a
//! pause, a crash, or a process restart. Records live in SQLite through the
//! shared [`Database`] wrapper.
//!
//! # Failure semantics
//!
//! Losing a resume marker only costs a re-download, so persistence I/O
//! failures on the hot paths are logged and swallowed, never propagated:
//! `save`, `flush`, and `clear` cannot fail from the caller's point of
//! view, and reads degrade to "no session".
//!
//! # Write throttling
//!
//! Progress ticks arrive far faster than they are worth persisting. `save`
//! drops writes that land within the configured minimum interval of the
//! previous write for the same item; `flush` bypasses the throttle for
//! moments that must not be lost (pause, interruption).

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use sqlx::FromRow;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::db::Database;

/// A persisted session record for one item.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRecord {
    /// The queue item this record belongs to.
    pub item_id: i64,
    /// Locator of the item; used to reconcile records across restarts.
    pub source_locator: String,
    /// Opaque engine resume token, stored as JSON text.
    pub resume_markers: String,
    /// Bytes transferred when the record was last written.
    pub bytes_downloaded: i64,
    /// Expected total bytes, when known.
    pub bytes_total: Option<i64>,
    /// Timestamp of the last write (SQLite `datetime('now')`).
    pub last_updated: String,
}

impl SessionRecord {
    /// Parses the stored resume markers.
    ///
    /// Returns `Value::Null` if the stored text is somehow invalid; a
    /// corrupt marker degrades to a full restart.
    #[must_use]
    pub fn markers(&self) -> Value {
        serde_json::from_str(&self.resume_markers).unwrap_or(Value::Null)
    }
}

/// SQLite-backed tracker of resumable download sessions.
///
/// Shared by all workers; rows are keyed by item id and never require
/// cross-item coordination.
#[derive(Debug)]
pub struct SessionTracker {
    db: Database,
    /// Minimum interval between persisted writes per item.
    persist_interval: Duration,
    /// Last persisted write per item, for throttling.
    last_persist: DashMap<u64, Instant>,
}

impl SessionTracker {
    /// Creates a tracker over the given database.
    #[must_use]
    pub fn new(db: Database, persist_interval: Duration) -> Self {
        Self {
            db,
            persist_interval,
            last_persist: DashMap::new(),
        }
    }

    /// Upserts the session record for an item, throttled to at most one
    /// write per [`persist interval`](Self::new) per item.
    ///
    /// Idempotent; called from progress callbacks on every tick. I/O
    /// failures are logged and swallowed.
    pub async fn save(
        &self,
        item_id: u64,
        source_locator: &str,
        resume_markers: &Value,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    ) {
        if let Some(last) = self.last_persist.get(&item_id) {
            if last.elapsed() < self.persist_interval {
                return;
            }
        }
        self.flush(item_id, source_locator, resume_markers, bytes_downloaded, bytes_total)
            .await;
    }

    /// Upserts the session record immediately, bypassing the throttle.
    ///
    /// Used when the latest markers must not be lost: pause, interruption,
    /// worker teardown. I/O failures are logged and swallowed.
    #[instrument(skip(self, resume_markers, source_locator))]
    pub async fn flush(
        &self,
        item_id: u64,
        source_locator: &str,
        resume_markers: &Value,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    ) {
        let markers_json = resume_markers.to_string();
        let result = sqlx::query(
            r"INSERT INTO sessions (
                item_id,
                source_locator,
                resume_markers,
                bytes_downloaded,
                bytes_total,
                last_updated
              )
              VALUES (?, ?, ?, ?, ?, datetime('now'))
              ON CONFLICT(item_id) DO UPDATE SET
                source_locator = excluded.source_locator,
                resume_markers = excluded.resume_markers,
                bytes_downloaded = excluded.bytes_downloaded,
                bytes_total = excluded.bytes_total,
                last_updated = excluded.last_updated",
        )
        .bind(to_db_id(item_id))
        .bind(source_locator)
        .bind(&markers_json)
        .bind(to_db_bytes(bytes_downloaded))
        .bind(bytes_total.map(to_db_bytes))
        .execute(self.db.pool())
        .await;

        match result {
            Ok(_) => {
                self.last_persist.insert(item_id, Instant::now());
            }
            Err(error) => warn!(item_id, error = %error, "failed to persist session record"),
        }
    }

    /// Loads the session record for an item, or `None` if absent.
    ///
    /// Read failures are logged and degrade to `None`.
    #[instrument(skip(self))]
    pub async fn load(&self, item_id: u64) -> Option<SessionRecord> {
        let result = sqlx::query_as::<_, SessionRecord>(
            r"SELECT * FROM sessions WHERE item_id = ?",
        )
        .bind(to_db_id(item_id))
        .fetch_optional(self.db.pool())
        .await;

        match result {
            Ok(record) => record,
            Err(error) => {
                warn!(item_id, error = %error, "failed to load session record");
                None
            }
        }
    }

    /// Finds the most recently updated session for a locator.
    #[instrument(skip(self), fields(locator = %source_locator))]
    pub async fn find_by_locator(&self, source_locator: &str) -> Option<SessionRecord> {
        let result = sqlx::query_as::<_, SessionRecord>(
            r"SELECT * FROM sessions
              WHERE source_locator = ?
              ORDER BY last_updated DESC
              LIMIT 1",
        )
        .bind(source_locator)
        .fetch_optional(self.db.pool())
        .await;

        match result {
            Ok(record) => record,
            Err(error) => {
                warn!(error = %error, "failed to look up session by locator");
                None
            }
        }
    }

    /// Rekeys a leftover session for `source_locator` to a new item id, so
    /// a resubmitted download adopts its predecessor's resume markers.
    ///
    /// No-op when no session exists for the locator.
    #[instrument(skip(self), fields(locator = %source_locator))]
    pub async fn rebind_locator(&self, source_locator: &str, new_item_id: u64) {
        let Some(record) = self.find_by_locator(source_locator).await else {
            return;
        };
        if record.item_id == to_db_id(new_item_id) {
            return;
        }

        let result = sqlx::query(r"UPDATE sessions SET item_id = ? WHERE item_id = ?")
            .bind(to_db_id(new_item_id))
            .bind(record.item_id)
            .execute(self.db.pool())
            .await;

        match result {
            Ok(_) => debug!(
                from = record.item_id,
                to = new_item_id,
                "session rebound to resubmitted item"
            ),
            Err(error) => warn!(error = %error, "failed to rebind session record"),
        }
    }

    /// Deletes session state for a finished item: the id-keyed record plus
    /// any leftover record for the same locator that was never rekeyed.
    ///
    /// I/O failures are logged and swallowed.
    #[instrument(skip(self, source_locator))]
    pub async fn clear_item(&self, item_id: u64, source_locator: &str) {
        self.last_persist.remove(&item_id);
        let result =
            sqlx::query(r"DELETE FROM sessions WHERE item_id = ? OR source_locator = ?")
                .bind(to_db_id(item_id))
                .bind(source_locator)
                .execute(self.db.pool())
                .await;

        if let Err(error) = result {
            warn!(item_id, error = %error, "failed to clear session state");
        }
    }

    /// Deletes the session record for an item. Called on terminal success,
    /// terminal failure, and explicit cancellation.
    ///
    /// I/O failures are logged and swallowed.
    #[instrument(skip(self))]
    pub async fn clear(&self, item_id: u64) {
        self.last_persist.remove(&item_id);
        let result = sqlx::query(r"DELETE FROM sessions WHERE item_id = ?")
            .bind(to_db_id(item_id))
            .execute(self.db.pool())
            .await;

        if let Err(error) = result {
            warn!(item_id, error = %error, "failed to clear session record");
        }
    }

    /// Loads every persisted session, oldest first.
    ///
    /// Used at startup to offer resume for downloads a previous process
    /// left behind. Read failures degrade to an empty list.
    #[instrument(skip(self))]
    pub async fn load_all(&self) -> Vec<SessionRecord> {
        let result = sqlx::query_as::<_, SessionRecord>(
            r"SELECT * FROM sessions ORDER BY last_updated ASC",
        )
        .fetch_all(self.db.pool())
        .await;

        match result {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "failed to load session records");
                Vec::new()
            }
        }
    }

    /// Deletes sessions older than `max_age`, returning how many were
    /// removed. Stale partial downloads are rarely worth resuming.
    #[instrument(skip(self))]
    pub async fn prune_stale(&self, max_age: Duration) -> u64 {
        let result = sqlx::query(
            r"DELETE FROM sessions
              WHERE last_updated < datetime('now', '-' || ? || ' seconds')",
        )
        .bind(to_db_bytes(max_age.as_secs()))
        .execute(self.db.pool())
        .await;

        match result {
            Ok(done) => done.rows_affected(),
            Err(error) => {
                warn!(error = %error, "failed to prune stale sessions");
                0
            }
        }
    }
}

/// Item ids are u64 in memory, i64 in SQLite. Ids are sequential from 1,
/// so the conversion never saturates in practice.
fn to_db_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn to_db_bytes(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
