use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::change::ChangeRecord;
use crate::cursor::{self, CursorStore};
use crate::watermark::Watermark;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
    entry_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name       TEXT NOT NULL,
    source_record_id  INTEGER NOT NULL,
    watermark         NOT NULL,
    payload           TEXT NOT NULL,
    detected_at       TIMESTAMP NOT NULL,
    enqueued_at       TIMESTAMP NOT NULL,
    attempts          INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    next_attempt_at   INTEGER,
    dead_lettered_at  TIMESTAMP,
    UNIQUE (source_name, source_record_id)
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_live
    ON queue_entries (dead_lettered_at, entry_id);

CREATE TABLE IF NOT EXISTS cursors (
    source_name      TEXT PRIMARY KEY,
    high_water_mark  NOT NULL,
    updated_at       TIMESTAMP NOT NULL
);
"#;

const ENTRY_COLUMNS: &str = "entry_id, source_name, source_record_id, payload, detected_at, \
     enqueued_at, attempts, last_error, next_attempt_at, dead_lettered_at, watermark";

/// Raised when the queue file can no longer be trusted. Never retried.
#[derive(Debug, Error)]
#[error("queue storage {path} is corrupt: {detail}")]
pub struct QueueCorrupt {
    pub path: PathBuf,
    pub detail: String,
}

/// A persisted [`ChangeRecord`] plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub entry_id: i64,
    pub record: ChangeRecord,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn source_name(&self) -> &str {
        &self.record.source_name
    }

    pub fn source_record_id(&self) -> i64 {
        self.record.source_record_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceQueueStats {
    pub source_name: String,
    /// Entries awaiting delivery, including deferred ones.
    pub pending: u64,
    /// Pending entries still inside their back-off window.
    pub deferred: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub sources: Vec<SourceQueueStats>,
}

impl QueueStats {
    pub fn pending(&self) -> u64 {
        self.sources.iter().map(|s| s.pending).sum()
    }

    pub fn dead_lettered(&self) -> u64 {
        self.sources.iter().map(|s| s.dead_lettered).sum()
    }
}

/// Connection shared by the queue and the cursor store.
///
/// Both live in one file so acknowledging entries and advancing a cursor can
/// commit in a single transaction.
pub(crate) struct QueueDb {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl QueueDb {
    pub(crate) fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("queue connection lock poisoned"))?;
        op(&mut conn).map_err(|err| storage_error(&self.path, err))
    }
}

/// Durable FIFO of detected changes.
#[derive(Clone)]
pub struct ChangeQueue {
    db: Arc<QueueDb>,
}

impl ChangeQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create queue directory {}", parent.display())
            })?;
            #[cfg(unix)]
            set_owner_perms(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open queue database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set queue busy timeout")?;

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|err| storage_error(path, err))?;
        if check != "ok" {
            return Err(QueueCorrupt {
                path: path.to_path_buf(),
                detail: check,
            }
            .into());
        }

        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for change queue")?;
        conn.pragma_update(None, "synchronous", "full")
            .context("failed to set synchronous=full for change queue")?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| storage_error(path, err))
            .context("failed to initialize queue schema")?;

        tracing::debug!(queue = %path.display(), "change queue opened");
        Ok(Self {
            db: Arc::new(QueueDb {
                path: path.to_path_buf(),
                conn: Mutex::new(conn),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db.path
    }

    /// Cursor store backed by the same file and connection.
    pub fn cursor_store(&self) -> CursorStore {
        CursorStore::new(Arc::clone(&self.db))
    }

    /// Appends one record. Returns `None` when the record is already queued
    /// at the same or a newer watermark.
    pub fn enqueue(&self, record: &ChangeRecord) -> Result<Option<i64>> {
        Ok(self
            .enqueue_batch(std::slice::from_ref(record))?
            .into_iter()
            .next())
    }

    /// Appends all records in one transaction: either every record is
    /// persisted or none is.
    ///
    /// A record whose key is already queued replaces the stored payload when
    /// its watermark is newer, so an edit made while the row waits for
    /// delivery is not lost. The entry keeps its position, attempts and
    /// dead-letter state. Records at the same or an older watermark are
    /// skipped. Returns the ids of inserted and refreshed entries.
    pub fn enqueue_batch(&self, records: &[ChangeRecord]) -> Result<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(records.len());
            {
                let mut existing = tx.prepare_cached(
                    "SELECT entry_id, watermark FROM queue_entries
                     WHERE source_name = ?1 AND source_record_id = ?2",
                )?;
                let mut insert = tx.prepare_cached(
                    "INSERT INTO queue_entries
                        (source_name, source_record_id, watermark, payload, detected_at, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                let mut refresh = tx.prepare_cached(
                    "UPDATE queue_entries
                     SET watermark = ?2, payload = ?3, detected_at = ?4
                     WHERE entry_id = ?1",
                )?;
                let now = Utc::now();
                for record in records {
                    let payload = serde_json::to_string(&record.payload)
                        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
                    let queued: Option<(i64, Watermark)> = existing
                        .query_row(params![record.source_name, record.source_record_id], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })
                        .optional()?;
                    match queued {
                        None => {
                            insert.execute(params![
                                record.source_name,
                                record.source_record_id,
                                record.watermark,
                                payload,
                                record.detected_at,
                                now,
                            ])?;
                            ids.push(tx.last_insert_rowid());
                        }
                        Some((entry_id, stored)) if record.watermark > stored => {
                            refresh.execute(params![
                                entry_id,
                                record.watermark,
                                payload,
                                record.detected_at,
                            ])?;
                            tracing::debug!(
                                source = %record.source_name,
                                record_id = record.source_record_id,
                                entry_id,
                                "refreshed queued entry with newer version"
                            );
                            ids.push(entry_id);
                        }
                        Some(_) => {}
                    }
                }
            }
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Oldest-first live entries. Does not remove anything, so repeated calls
    /// return the same entries until they are acknowledged.
    pub fn peek_batch(&self, max_size: usize) -> Result<Vec<QueueEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS}
                 FROM queue_entries
                 WHERE dead_lettered_at IS NULL
                 ORDER BY entry_id ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map([max_size as i64], entry_from_row)?;
            rows.collect()
        })
    }

    /// Like [`peek_batch`](Self::peek_batch) but skips every source whose
    /// queue contains an entry still backing off, so a later entry of that
    /// source never overtakes an earlier one.
    pub fn peek_ready_batch(&self, max_size: usize, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS}
                 FROM queue_entries
                 WHERE dead_lettered_at IS NULL
                   AND source_name NOT IN (
                       SELECT source_name FROM queue_entries
                       WHERE dead_lettered_at IS NULL
                         AND next_attempt_at IS NOT NULL
                         AND next_attempt_at > ?2
                   )
                 ORDER BY entry_id ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map(
                params![max_size as i64, now.timestamp_millis()],
                entry_from_row,
            )?;
            rows.collect()
        })
    }

    /// Permanently removes the given entries in one transaction.
    pub fn acknowledge(&self, entry_ids: &[i64]) -> Result<u64> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = delete_entries(&tx, entry_ids)?;
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Removes delivered entries of `source_name` and moves its cursor to
    /// the highest delivered watermark, in one transaction. The cursor never
    /// moves backwards.
    ///
    /// An entry refreshed with a newer version after it was peeked is kept,
    /// so that version is delivered too. Returns the number of removed
    /// entries.
    pub fn acknowledge_and_advance(&self, source_name: &str, delivered: &[QueueEntry]) -> Result<u64> {
        let Some(high_water_mark) = delivered
            .iter()
            .map(|entry| entry.record.watermark)
            .reduce(Watermark::max)
        else {
            return Ok(0);
        };
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut removed = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "DELETE FROM queue_entries WHERE entry_id = ?1 AND watermark = ?2",
                )?;
                for entry in delivered {
                    removed += stmt.execute(params![entry.entry_id, entry.record.watermark])? as u64;
                }
            }
            cursor::advance_in(&tx, source_name, high_water_mark)?;
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Records a failed delivery attempt; the entry stays queued.
    pub fn mark_failed(
        &self,
        entry_id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_entries
                 SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
                 WHERE entry_id = ?1 AND dead_lettered_at IS NULL",
                params![entry_id, error, retry_at.map(|at| at.timestamp_millis())],
            )
        })?;
        if updated == 0 {
            tracing::warn!(entry_id, "mark_failed on an entry that is not pending");
        }
        Ok(())
    }

    /// Moves an entry to the dead-letter state. It is kept for inspection
    /// but no longer returned by `peek_*`.
    pub fn dead_letter(&self, entry_id: i64, error: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_entries
                 SET attempts = attempts + 1, last_error = ?2,
                     next_attempt_at = NULL, dead_lettered_at = ?3
                 WHERE entry_id = ?1 AND dead_lettered_at IS NULL",
                params![entry_id, error, Utc::now()],
            )
        })?;
        Ok(())
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS}
                 FROM queue_entries
                 WHERE dead_lettered_at IS NOT NULL
                 ORDER BY entry_id ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit as i64], entry_from_row)?;
            rows.collect()
        })
    }

    /// Returns a dead-lettered entry to the live queue with a fresh attempt
    /// budget. Returns false if no such dead letter exists.
    pub fn requeue_dead_letter(&self, entry_id: i64) -> Result<bool> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_entries
                 SET attempts = 0, next_attempt_at = NULL, dead_lettered_at = NULL
                 WHERE entry_id = ?1 AND dead_lettered_at IS NOT NULL",
                [entry_id],
            )
        })?;
        Ok(updated == 1)
    }

    /// Requeues every dead letter, optionally only those of one source.
    pub fn requeue_dead_letters(&self, source_name: Option<&str>) -> Result<u64> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_entries
                 SET attempts = 0, next_attempt_at = NULL, dead_lettered_at = NULL
                 WHERE dead_lettered_at IS NOT NULL
                   AND (?1 IS NULL OR source_name = ?1)",
                [source_name],
            )
        })?;
        Ok(updated as u64)
    }

    pub fn purge_dead_letters(&self, entry_ids: &[i64]) -> Result<u64> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut removed = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "DELETE FROM queue_entries
                     WHERE entry_id = ?1 AND dead_lettered_at IS NOT NULL",
                )?;
                for id in entry_ids {
                    removed += stmt.execute([id])? as u64;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    pub fn purge_all_dead_letters(&self) -> Result<u64> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM queue_entries WHERE dead_lettered_at IS NOT NULL",
                [],
            )
        })?;
        Ok(removed as u64)
    }

    /// Highest watermark still present in the queue for `source_name`,
    /// pending or dead-lettered.
    pub fn max_watermark(&self, source_name: &str) -> Result<Option<Watermark>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT MAX(watermark) FROM queue_entries WHERE source_name = ?1",
                [source_name],
                |row| row.get(0),
            )
        })
    }

    pub fn get_entry(&self, entry_id: i64) -> Result<Option<QueueEntry>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE entry_id = ?1"),
                [entry_id],
                entry_from_row,
            )
            .optional()
        })
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let sources = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT source_name,
                        SUM(CASE WHEN dead_lettered_at IS NULL THEN 1 ELSE 0 END),
                        SUM(CASE WHEN dead_lettered_at IS NULL
                                  AND next_attempt_at IS NOT NULL
                                  AND next_attempt_at > ?1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN dead_lettered_at IS NOT NULL THEN 1 ELSE 0 END)
                 FROM queue_entries
                 GROUP BY source_name
                 ORDER BY source_name",
            )?;
            let rows = stmt.query_map([now.timestamp_millis()], |row| {
                Ok(SourceQueueStats {
                    source_name: row.get(0)?,
                    pending: row.get::<_, i64>(1)? as u64,
                    deferred: row.get::<_, i64>(2)? as u64,
                    dead_lettered: row.get::<_, i64>(3)? as u64,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(QueueStats { sources })
    }
}

fn delete_entries(conn: &Connection, entry_ids: &[i64]) -> rusqlite::Result<u64> {
    let mut stmt = conn.prepare_cached("DELETE FROM queue_entries WHERE entry_id = ?1")?;
    let mut removed = 0u64;
    for id in entry_ids {
        removed += stmt.execute([id])? as u64;
    }
    Ok(removed)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let payload_text: String = row.get(3)?;
    let payload: Map<String, Value> = serde_json::from_str(&payload_text)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
    let next_attempt_ms: Option<i64> = row.get(8)?;
    Ok(QueueEntry {
        entry_id: row.get(0)?,
        record: ChangeRecord {
            source_name: row.get(1)?,
            source_record_id: row.get(2)?,
            watermark: row.get(10)?,
            payload,
            detected_at: row.get(4)?,
        },
        enqueued_at: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        next_attempt_at: next_attempt_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        dead_lettered_at: row.get(9)?,
    })
}

fn storage_error(path: &Path, err: rusqlite::Error) -> anyhow::Error {
    let corrupt = match &err {
        rusqlite::Error::SqliteFailure(inner, _) => {
            matches!(inner.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
        }
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            true
        }
        _ => false,
    };
    if corrupt {
        tracing::error!(queue = %path.display(), error = %err, "queue storage corruption detected");
        QueueCorrupt {
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
        .into()
    } else {
        anyhow::Error::new(err).context(format!("queue operation failed on {}", path.display()))
    }
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}
