// Persistent queue store: the single source of truth for undelivered messages
//
// Every status transition is one conditional UPDATE keyed on the current
// status, so two dispatch loops can never own the same record. All writes go
// through tokio-rusqlite's single background connection.

pub mod migrations;
pub mod models;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

pub use models::{
    Completion, LaneCounts, MessageStatus, PendingRetry, QueueStats, QueuedMessage, RecordId,
    RelayMessage,
};

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open queue database: {0}")]
    Open(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Database(String),
}

fn map_db_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Maximum number of retry entries reported by `stats()`
const PENDING_RETRY_LIMIT: usize = 50;

const RECORD_COLUMNS: &str = "id, request_id, message_hash, requester, target, amount, token, \
     origin_chain, target_chain, message, timestamp, expiry_time, origin_chain_key, \
     block_number, tx_hash, retry_count, priority, status, queued_at, next_retry_at, \
     processing_started_at, completed_at, last_error, delivery_tx_hash";

const ACTIVE_STATUSES: &str = "('queued', 'processing', 'retry')";

/// Durable relay queue backed by SQLite
#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Connection>,
}

impl QueueStore {
    /// Open (or create) the queue database at `path` and apply migrations
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Open(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)
            .await
            .map_err(|e| StoreError::Open(format!("{}: {}", path.display(), e)))?;
        let store = Self::init(conn).await?;
        info!("Opened relay queue database at {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory queue, mostly useful for tests and dry runs
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        })
        .await
        .map_err(|e: tokio_rusqlite::Error<rusqlite::Error>| StoreError::Open(e.to_string()))?;

        let applied = conn
            .call(|conn| migrations::run_migrations(conn))
            .await
            .map_err(|e: tokio_rusqlite::Error<refinery::Error>| {
                StoreError::Migration(e.to_string())
            })?;
        if applied > 0 {
            info!("Applied {} queue schema migration(s)", applied);
        }

        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    /// Insert a new message with `status = queued`.
    ///
    /// Returns `None` without error when the message is already expired, is
    /// structurally invalid, or the `(origin_chain, request_id)` pair is
    /// already queued or archived.
    pub async fn enqueue(
        &self,
        message: &RelayMessage,
        is_priority: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<RecordId>, StoreError> {
        if message.is_expired_at(now) {
            debug!(
                request_id = %message.request_id,
                origin_chain = message.origin_chain,
                "Rejecting already expired message"
            );
            return Ok(None);
        }
        if let Err(reason) = message.validate() {
            warn!(request_id = %message.request_id, "Rejecting invalid message: {}", reason);
            return Ok(None);
        }

        let m = message.clone();
        let queued_at = now.timestamp_millis();
        let inserted = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO relay_queue (
                        request_id, message_hash, requester, target, amount, token,
                        origin_chain, target_chain, message, timestamp, expiry_time,
                        origin_chain_key, block_number, tx_hash,
                        retry_count, priority, status, queued_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                               0, ?15, 'queued', ?16)",
                    params![
                        m.request_id.to_string(),
                        m.message_hash.to_string(),
                        m.requester.to_string(),
                        m.target.to_string(),
                        m.amount.to_string(),
                        m.token,
                        m.origin_chain as i64,
                        m.target_chain as i64,
                        m.message,
                        m.timestamp.timestamp_millis(),
                        m.expiry_time.timestamp_millis(),
                        m.origin_chain_key,
                        m.block_number as i64,
                        m.tx_hash.to_string(),
                        is_priority,
                        queued_at,
                    ],
                )?;
                if changed == 0 {
                    Ok(None)
                } else {
                    Ok(Some(RecordId(conn.last_insert_rowid())))
                }
            })
            .await
            .map_err(map_db_err)?;

        if inserted.is_none() {
            debug!(
                request_id = %message.request_id,
                origin_chain = message.origin_chain,
                "Message already present in queue"
            );
        }
        Ok(inserted)
    }

    /// Atomically claim the next eligible message.
    ///
    /// Messages for `preferred_chain` come first, then priority over standard
    /// lane, then oldest `queued_at`. Falls back to any target chain when the
    /// preferred chain has nothing eligible.
    pub async fn dequeue_next(
        &self,
        preferred_chain: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, StoreError> {
        self.claim_next(preferred_chain, false, now).await
    }

    /// Atomically claim the next eligible priority-lane message for any chain
    pub async fn dequeue_next_priority(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, StoreError> {
        self.claim_next(None, true, now).await
    }

    async fn claim_next(
        &self,
        preferred_chain: Option<u64>,
        priority_only: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, StoreError> {
        let now_ms = now.timestamp_millis();
        let preferred = preferred_chain.map(|id| id as i64);
        let lane_clause = if priority_only { "AND priority = 1" } else { "" };
        let sql = format!(
            "UPDATE relay_queue
             SET status = 'processing', processing_started_at = ?1
             WHERE id = (
                 SELECT id FROM relay_queue
                 WHERE status = 'queued'
                   AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                   AND expiry_time > ?1
                   {lane_clause}
                 ORDER BY (target_chain = ?2) DESC, priority DESC, queued_at ASC, id ASC
                 LIMIT 1
             )
             AND status = 'queued'
             RETURNING {RECORD_COLUMNS}"
        );

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let record = stmt
                    .query_row(params![now_ms, preferred], record_from_row)
                    .optional()?;
                Ok(record)
            })
            .await
            .map_err(map_db_err)
    }

    /// Terminal transition to `completed` or `failed`.
    ///
    /// Returns `false` when the record is already terminal (or unknown); the
    /// call then has no effect.
    pub async fn mark_completed(
        &self,
        id: RecordId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let status = completion.status();
        let (tx_hash, reason) = match completion {
            Completion::Delivered { tx_hash } => (Some(tx_hash.to_string()), None),
            Completion::Failed { reason } => (None, Some(reason)),
        };
        let now_ms = now.timestamp_millis();
        let sql = format!(
            "UPDATE relay_queue
             SET status = ?2, completed_at = ?3,
                 delivery_tx_hash = COALESCE(?4, delivery_tx_hash),
                 last_error = COALESCE(?5, last_error),
                 next_retry_at = NULL, processing_started_at = NULL
             WHERE id = ?1 AND status IN {ACTIVE_STATUSES}"
        );
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(&sql, params![id.0, status.as_str(), now_ms, tx_hash, reason])
            })
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    /// `{queued, retry} -> completed` for a message delivered outside the
    /// dispatch loops. Records a loop currently owns are left alone.
    pub async fn complete_unclaimed(
        &self,
        id: RecordId,
        tx_hash: alloy_primitives::B256,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let tx_hash = tx_hash.to_string();
        let now_ms = now.timestamp_millis();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE relay_queue
                     SET status = 'completed', completed_at = ?2, delivery_tx_hash = ?3,
                         next_retry_at = NULL
                     WHERE id = ?1 AND status IN ('queued', 'retry')",
                    params![id.0, now_ms, tx_hash],
                )
            })
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    /// `processing -> retry`, consuming one unit of the retry budget
    pub async fn schedule_retry(
        &self,
        id: RecordId,
        delay: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.to_retry(id, delay, error, true, now).await
    }

    /// `processing -> retry` without touching `retry_count`; used when the
    /// target chain was never reachable, so no attempt was made
    pub async fn defer(
        &self,
        id: RecordId,
        delay: Duration,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.to_retry(id, delay, reason, false, now).await
    }

    async fn to_retry(
        &self,
        id: RecordId,
        delay: Duration,
        error: &str,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let next_retry_at = now.timestamp_millis() + duration_millis(delay);
        let increment: i64 = if count_attempt { 1 } else { 0 };
        let error = error.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE relay_queue
                     SET status = 'retry', retry_count = retry_count + ?2,
                         next_retry_at = ?3, last_error = ?4, processing_started_at = NULL
                     WHERE id = ?1 AND status = 'processing'",
                    params![id.0, increment, next_retry_at, error],
                )
            })
            .await
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    /// Bulk `retry -> queued` for every record whose `next_retry_at <= now`.
    ///
    /// Promoted records get a fresh `queued_at`, so they line up behind
    /// messages that were never attempted.
    pub async fn promote_due_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let sql = format!(
            "UPDATE relay_queue
             SET status = 'queued', next_retry_at = NULL, queued_at = ?1
             WHERE status = 'retry' AND next_retry_at <= ?1
             RETURNING {RECORD_COLUMNS}"
        );
        self.bulk_transition(sql, now.timestamp_millis()).await
    }

    /// Bulk `{queued, retry} -> expired` for every record past its deadline
    pub async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let sql = format!(
            "UPDATE relay_queue
             SET status = 'expired', completed_at = ?1, next_retry_at = NULL
             WHERE status IN ('queued', 'retry') AND expiry_time < ?1
             RETURNING {RECORD_COLUMNS}"
        );
        self.bulk_transition(sql, now.timestamp_millis()).await
    }

    /// Bulk `processing -> queued` for records claimed at or before `cutoff`.
    ///
    /// Only safe for records no live dispatch loop can still own.
    pub async fn recover_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let sql = format!(
            "UPDATE relay_queue
             SET status = 'queued', processing_started_at = NULL
             WHERE status = 'processing' AND processing_started_at <= ?1
             RETURNING {RECORD_COLUMNS}"
        );
        self.bulk_transition(sql, cutoff.timestamp_millis()).await
    }

    async fn bulk_transition(
        &self,
        sql: String,
        at_ms: i64,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(params![at_ms], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(map_db_err)
    }

    /// Queue composition grouped by status, target chain and lane
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.conn
            .call(|conn| {
                let mut stats = QueueStats::default();

                let mut stmt = conn.prepare(
                    "SELECT target_chain, status, COUNT(*) FROM relay_queue
                     GROUP BY target_chain, status",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        parse_column::<MessageStatus>(row, 1)?,
                        row.get::<_, i64>(2)? as u64,
                    ))
                })?;
                for row in rows {
                    let (chain_id, status, count) = row?;
                    stats.total += count;
                    *stats.by_status.entry(status).or_insert(0) += count;
                    *stats
                        .by_chain
                        .entry(chain_id)
                        .or_default()
                        .entry(status)
                        .or_insert(0) += count;
                }

                let mut stmt = conn.prepare(&format!(
                    "SELECT priority, COUNT(*) FROM relay_queue
                     WHERE status IN {ACTIVE_STATUSES}
                     GROUP BY priority"
                ))?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)? as u64))
                })?;
                for row in rows {
                    let (priority, count) = row?;
                    if priority {
                        stats.by_priority.priority = count;
                    } else {
                        stats.by_priority.standard = count;
                    }
                }

                let mut stmt = conn.prepare(
                    "SELECT id, request_id, origin_chain, target_chain, retry_count,
                            next_retry_at, last_error
                     FROM relay_queue
                     WHERE status = 'retry'
                     ORDER BY next_retry_at ASC, id ASC
                     LIMIT ?1",
                )?;
                stats.pending_retries = stmt
                    .query_map(params![PENDING_RETRY_LIMIT as i64], |row| {
                        Ok(PendingRetry {
                            id: RecordId(row.get(0)?),
                            request_id: parse_column(row, 1)?,
                            origin_chain: row.get::<_, i64>(2)? as u64,
                            target_chain: row.get::<_, i64>(3)? as u64,
                            retry_count: row.get(4)?,
                            next_retry_at: optional_instant(row, 5)?,
                            last_error: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(stats)
            })
            .await
            .map_err(map_db_err)
    }

    /// Fetch a record by row id
    pub async fn get(&self, id: RecordId) -> Result<Option<QueuedMessage>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM relay_queue WHERE id = ?1");
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_row(params![id.0], record_from_row).optional()
            })
            .await
            .map_err(map_db_err)
    }

    /// Fetch a record by its composite identity
    pub async fn find(
        &self,
        origin_chain: u64,
        request_id: alloy_primitives::U256,
    ) -> Result<Option<QueuedMessage>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM relay_queue WHERE origin_chain = ?1 AND request_id = ?2"
        );
        let request_id = request_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_row(params![origin_chain as i64, request_id], record_from_row)
                    .optional()
            })
            .await
            .map_err(map_db_err)
    }

    /// List records for audit and export, newest first
    pub async fn list(
        &self,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM relay_queue
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC
             LIMIT ?2"
        );
        let status = status.map(|s| s.as_str());
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(params![status, limit as i64], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(map_db_err)
    }

    /// Read a process-wide cursor
    pub async fn get_cursor(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT value FROM relay_state WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
            .map_err(map_db_err)
    }

    /// Write a process-wide cursor
    pub async fn set_cursor(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let now_ms = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO relay_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    updated_at = excluded.updated_at",
                    params![key, value, now_ms],
                )?;
                Ok(())
            })
            .await
            .map_err(map_db_err)
    }
}

fn duration_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| conversion_error(idx, format!("{:?}: {}", text, e)))
}

fn optional_parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        text.parse::<T>()
            .map_err(|e| conversion_error(idx, format!("{:?}: {}", text, e)))
    })
    .transpose()
}

fn instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {}", millis)))
}

fn optional_instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|millis| {
            DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                conversion_error(idx, format!("timestamp out of range: {}", millis))
            })
        })
        .transpose()
}

/// Map a row selected with `RECORD_COLUMNS`
fn record_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    Ok(QueuedMessage {
        id: RecordId(row.get(0)?),
        message: RelayMessage {
            request_id: parse_column(row, 1)?,
            message_hash: parse_column(row, 2)?,
            requester: parse_column(row, 3)?,
            target: parse_column(row, 4)?,
            amount: parse_column(row, 5)?,
            token: row.get(6)?,
            origin_chain: row.get::<_, i64>(7)? as u64,
            target_chain: row.get::<_, i64>(8)? as u64,
            message: row.get(9)?,
            timestamp: instant(row, 10)?,
            expiry_time: instant(row, 11)?,
            origin_chain_key: row.get(12)?,
            block_number: row.get::<_, i64>(13)? as u64,
            tx_hash: parse_column(row, 14)?,
        },
        retry_count: row.get(15)?,
        priority: row.get(16)?,
        status: parse_column(row, 17)?,
        queued_at: instant(row, 18)?,
        next_retry_at: optional_instant(row, 19)?,
        processing_started_at: optional_instant(row, 20)?,
        completed_at: optional_instant(row, 21)?,
        last_error: row.get(22)?,
        delivery_tx_hash: optional_parse_column(row, 23)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, U256};
    use chrono::Duration as ChronoDuration;

    fn test_message(request_id: u64, origin_chain: u64, target_chain: u64) -> RelayMessage {
        let now = Utc::now();
        RelayMessage {
            request_id: U256::from(request_id),
            message_hash: B256::with_last_byte(request_id as u8),
            requester: Address::with_last_byte(1),
            target: Address::with_last_byte(2),
            amount: U256::from(25_000_000u64),
            token: "USDC".to_string(),
            origin_chain,
            target_chain,
            message: format!("invoice #{}", request_id),
            timestamp: now - ChronoDuration::seconds(10),
            expiry_time: now + ChronoDuration::hours(1),
            origin_chain_key: "sepolia".to_string(),
            block_number: 6_000_000 + request_id,
            tx_hash: B256::with_last_byte(0xaa),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue_lifecycle() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        let id = store
            .enqueue(&test_message(1, 11155111, 84532), false, now)
            .await
            .unwrap()
            .expect("message should be accepted");

        let record = store.dequeue_next(Some(84532), now).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.status, MessageStatus::Processing);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.message.amount, U256::from(25_000_000u64));
        assert!(record.processing_started_at.is_some());

        // Nothing left to hand out while the record is processing
        assert!(store.dequeue_next(Some(84532), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_expired_message() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let mut message = test_message(2, 11155111, 84532);
        message.timestamp = Utc::now() - ChronoDuration::hours(2);
        message.expiry_time = Utc::now() - ChronoDuration::seconds(1);

        let result = store.enqueue(&message, false, Utc::now()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_composite_identity_prevents_cross_chain_collision() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        // Same request id from two different origin chains
        let a = store.enqueue(&test_message(5, 11155111, 84532), false, now).await.unwrap();
        let b = store.enqueue(&test_message(5, 421614, 84532), false, now).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert_ne!(a, b);

        // Re-discovering the same event is rejected
        let dup = store.enqueue(&test_message(5, 11155111, 84532), true, now).await.unwrap();
        assert!(dup.is_none());

        let found = store.find(421614, U256::from(5u64)).await.unwrap().unwrap();
        assert_eq!(Some(found.id), b);
    }

    #[tokio::test]
    async fn test_priority_message_dequeued_first() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let earlier = Utc::now() - ChronoDuration::seconds(5);
        let now = Utc::now();

        let standard = store
            .enqueue(&test_message(10, 11155111, 84532), false, earlier)
            .await
            .unwrap()
            .unwrap();
        let priority = store
            .enqueue(&test_message(11, 11155111, 84532), true, now)
            .await
            .unwrap()
            .unwrap();

        let first = store.dequeue_next(Some(84532), now).await.unwrap().unwrap();
        let second = store.dequeue_next(Some(84532), now).await.unwrap().unwrap();
        assert_eq!(first.id, priority);
        assert_eq!(second.id, standard);
    }

    #[tokio::test]
    async fn test_preferred_chain_then_fallback() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let earlier = Utc::now() - ChronoDuration::seconds(5);
        let now = Utc::now();

        let other = store
            .enqueue(&test_message(20, 84532, 11155111), true, earlier)
            .await
            .unwrap()
            .unwrap();
        let preferred = store
            .enqueue(&test_message(21, 11155111, 84532), false, now)
            .await
            .unwrap()
            .unwrap();

        let first = store.dequeue_next(Some(84532), now).await.unwrap().unwrap();
        assert_eq!(first.id, preferred);

        // Nothing left for 84532, fall back to the other chain
        let second = store.dequeue_next(Some(84532), now).await.unwrap().unwrap();
        assert_eq!(second.id, other);
    }

    #[tokio::test]
    async fn test_priority_lane_ignores_standard_messages() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        store.enqueue(&test_message(30, 11155111, 84532), false, now).await.unwrap();

        assert!(store.dequeue_next_priority(now).await.unwrap().is_none());

        let id = store
            .enqueue(&test_message(31, 11155111, 421614), true, now)
            .await
            .unwrap()
            .unwrap();
        let record = store.dequeue_next_priority(now).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert!(record.priority);
    }

    #[tokio::test]
    async fn test_mark_completed_is_idempotent() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let id = store
            .enqueue(&test_message(40, 11155111, 84532), false, now)
            .await
            .unwrap()
            .unwrap();
        store.dequeue_next(None, now).await.unwrap().unwrap();

        let tx_hash = B256::with_last_byte(0x42);
        assert!(store
            .mark_completed(id, Completion::Delivered { tx_hash }, now)
            .await
            .unwrap());
        let after_first = store.get(id).await.unwrap().unwrap();

        // Second call, even with a different outcome, changes nothing
        assert!(!store
            .mark_completed(
                id,
                Completion::Failed {
                    reason: "late failure".to_string()
                },
                now + ChronoDuration::seconds(5)
            )
            .await
            .unwrap());
        let after_second = store.get(id).await.unwrap().unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.status, MessageStatus::Completed);
        assert_eq!(after_second.delivery_tx_hash, Some(tx_hash));
    }

    #[tokio::test]
    async fn test_schedule_retry_and_promote() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let id = store
            .enqueue(&test_message(50, 11155111, 84532), false, now)
            .await
            .unwrap()
            .unwrap();
        store.dequeue_next(None, now).await.unwrap().unwrap();

        assert!(store
            .schedule_retry(id, Duration::from_secs(30), "nonce too low", now)
            .await
            .unwrap());
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Retry);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("nonce too low"));
        assert_eq!(
            record.next_retry_at.unwrap().timestamp_millis(),
            now.timestamp_millis() + 30_000
        );

        // Only processing records can be rescheduled
        assert!(!store
            .schedule_retry(id, Duration::from_secs(30), "again", now)
            .await
            .unwrap());

        // Not yet due
        assert!(store.promote_due_retries(now).await.unwrap().is_empty());
        assert!(store.dequeue_next(None, now).await.unwrap().is_none());

        let later = now + ChronoDuration::seconds(31);
        let promoted = store.promote_due_retries(later).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].status, MessageStatus::Queued);
        assert_eq!(promoted[0].next_retry_at, None);
        assert_eq!(promoted[0].retry_count, 1);

        let again = store.dequeue_next(None, later).await.unwrap().unwrap();
        assert_eq!(again.id, id);
    }

    #[tokio::test]
    async fn test_defer_keeps_retry_budget() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let id = store
            .enqueue(&test_message(55, 11155111, 84532), false, now)
            .await
            .unwrap()
            .unwrap();
        store.dequeue_next(None, now).await.unwrap().unwrap();

        assert!(store
            .defer(id, Duration::from_secs(5), "chain not ready", now)
            .await
            .unwrap());
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Retry);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_expire_overdue_skips_terminal_and_processing() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        let queued = store
            .enqueue(&test_message(60, 11155111, 84532), false, now)
            .await
            .unwrap()
            .unwrap();
        let processing = store
            .enqueue(&test_message(61, 11155111, 421614), false, now)
            .await
            .unwrap()
            .unwrap();
        let claimed = store.dequeue_next(Some(421614), now).await.unwrap().unwrap();
        assert_eq!(claimed.id, processing);

        let after_deadline = now + ChronoDuration::hours(2);
        let expired = store.expire_overdue(after_deadline).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, queued);
        assert_eq!(expired[0].status, MessageStatus::Expired);

        // Terminal records stay untouched on the next sweep
        assert!(store.expire_overdue(after_deadline).await.unwrap().is_empty());
        assert_eq!(
            store.get(processing).await.unwrap().unwrap().status,
            MessageStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_recover_stale_processing() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let claimed_at = Utc::now() - ChronoDuration::minutes(10);
        let id = store
            .enqueue(&test_message(70, 11155111, 84532), false, claimed_at)
            .await
            .unwrap()
            .unwrap();
        store.dequeue_next(None, claimed_at).await.unwrap().unwrap();

        // Grace period not yet elapsed for a cutoff before the claim
        let too_early = claimed_at - ChronoDuration::seconds(1);
        assert!(store.recover_stale_processing(too_early).await.unwrap().is_empty());

        let recovered = store.recover_stale_processing(Utc::now()).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, id);
        assert_eq!(recovered[0].status, MessageStatus::Queued);
        assert_eq!(recovered[0].processing_started_at, None);
    }

    #[tokio::test]
    async fn test_stats_grouping() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        store.enqueue(&test_message(80, 11155111, 84532), true, now).await.unwrap();
        store.enqueue(&test_message(81, 11155111, 84532), false, now).await.unwrap();
        let retrying = store
            .enqueue(&test_message(82, 84532, 11155111), false, now)
            .await
            .unwrap()
            .unwrap();
        store.dequeue_next(Some(11155111), now).await.unwrap().unwrap();
        store
            .schedule_retry(retrying, Duration::from_secs(60), "timeout", now)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(MessageStatus::Queued), 2);
        assert_eq!(stats.count(MessageStatus::Retry), 1);
        assert_eq!(stats.chain_count(84532, MessageStatus::Queued), 2);
        assert_eq!(stats.chain_count(11155111, MessageStatus::Retry), 1);
        assert_eq!(stats.by_priority, LaneCounts { priority: 1, standard: 2 });
        assert_eq!(stats.pending_retries.len(), 1);
        assert_eq!(stats.pending_retries[0].retry_count, 1);
        assert_eq!(stats.pending_retries[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        store.enqueue(&test_message(90, 11155111, 84532), false, now).await.unwrap();
        let failed = store
            .enqueue(&test_message(91, 11155111, 84532), false, now)
            .await
            .unwrap()
            .unwrap();
        store
            .mark_completed(
                failed,
                Completion::Failed {
                    reason: "execution reverted".to_string(),
                },
                now,
            )
            .await
            .unwrap();

        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_failed = store.list(Some(MessageStatus::Failed), 10).await.unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].id, failed);
        assert_eq!(only_failed[0].last_error.as_deref(), Some("execution reverted"));
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let store = QueueStore::open_in_memory().await.unwrap();
        assert_eq!(store.get_cursor("sepolia:last_block").await.unwrap(), None);
        store.set_cursor("sepolia:last_block", "6000100").await.unwrap();
        store.set_cursor("sepolia:last_block", "6000200").await.unwrap();
        assert_eq!(
            store.get_cursor("sepolia:last_block").await.unwrap().as_deref(),
            Some("6000200")
        );
    }
}
