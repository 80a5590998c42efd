use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::queue::QueueDb;
use crate::watermark::Watermark;

/// Per-source high-water mark: the greatest watermark known to be
/// delivered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cursor {
    pub source_name: String,
    pub high_water_mark: Watermark,
    pub updated_at: DateTime<Utc>,
}

/// Reads and advances cursors stored next to the change queue.
#[derive(Clone)]
pub struct CursorStore {
    db: Arc<QueueDb>,
}

impl CursorStore {
    pub(crate) fn new(db: Arc<QueueDb>) -> Self {
        Self { db }
    }

    pub fn get(&self, source_name: &str) -> Result<Option<Cursor>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT source_name, high_water_mark, updated_at FROM cursors WHERE source_name = ?1",
                [source_name],
                |row| {
                    Ok(Cursor {
                        source_name: row.get(0)?,
                        high_water_mark: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    /// High-water mark for `source_name`, [`Watermark::START`] when the
    /// source has never been delivered.
    pub fn high_water_mark(&self, source_name: &str) -> Result<Watermark> {
        Ok(self
            .get(source_name)?
            .map(|cursor| cursor.high_water_mark)
            .unwrap_or(Watermark::START))
    }

    /// Moves the cursor forward. A value at or below the stored mark is
    /// ignored, so the cursor is monotonic no matter who calls this.
    pub fn advance(&self, source_name: &str, high_water_mark: Watermark) -> Result<Watermark> {
        self.db.with_conn(|conn| {
            advance_in(conn, source_name, high_water_mark)?;
            read_in(conn, source_name)
        })
    }

    pub fn list(&self) -> Result<Vec<Cursor>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT source_name, high_water_mark, updated_at FROM cursors ORDER BY source_name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Cursor {
                    source_name: row.get(0)?,
                    high_water_mark: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }
}

pub(crate) fn advance_in(
    conn: &Connection,
    source_name: &str,
    high_water_mark: Watermark,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO cursors (source_name, high_water_mark, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(source_name) DO UPDATE SET
             high_water_mark = MAX(cursors.high_water_mark, excluded.high_water_mark),
             updated_at = CASE
                 WHEN excluded.high_water_mark > cursors.high_water_mark THEN excluded.updated_at
                 ELSE cursors.updated_at
             END",
        params![source_name, high_water_mark, Utc::now()],
    )?;
    Ok(())
}

fn read_in(conn: &Connection, source_name: &str) -> rusqlite::Result<Watermark> {
    conn.query_row(
        "SELECT high_water_mark FROM cursors WHERE source_name = ?1",
        [source_name],
        |row| row.get(0),
    )
}
