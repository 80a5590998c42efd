use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::ChangeRecord;
use crate::watermark::Watermark;

/// Why a detection pass produced nothing even though data may exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectError {
    #[error("source database is locked by a writer: {0}")]
    Busy(String),
    #[error("source database is unavailable: {0}")]
    Unavailable(String),
    #[error("detection failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectOutcome {
    /// Records newer than the watermark, oldest first. `candidate` is the
    /// highest watermark observed and is not committed anywhere by the
    /// detector.
    Changes {
        records: Vec<ChangeRecord>,
        candidate: Watermark,
    },
    NoChanges,
    RetryLater(DetectError),
}

/// Source-specific change detection.
///
/// Implementations read from a source ordered by a non-decreasing
/// [`Watermark`]: an integer id for append-only tables, a modification time
/// for tables edited in place. Gaps are expected.
pub trait SourceDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Returns at most `limit` records with a watermark greater than `after`.
    fn detect(&self, after: Watermark, limit: usize) -> DetectOutcome;

    /// File whose changes should trigger detection, if any.
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}

/// Built-in queries for the macOS databases tosh syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePreset {
    Messages,
    Calls,
    Contacts,
}

const MESSAGES_QUERY: &str = r#"
SELECT
    m.ROWID AS rowid,
    m.guid,
    m.text,
    m.handle_id,
    h.id AS handle_identifier,
    m.service,
    m.date,
    m.date_read,
    m.date_delivered,
    m.is_from_me,
    m.cache_has_attachments,
    m.thread_originator_guid,
    (SELECT cmj.chat_id FROM chat_message_join cmj
      WHERE cmj.message_id = m.ROWID
      ORDER BY cmj.chat_id LIMIT 1) AS chat_id
FROM message m
LEFT JOIN handle h ON h.ROWID = m.handle_id
WHERE m.guid IS NOT NULL AND m.ROWID > ?1
ORDER BY m.ROWID ASC
LIMIT ?2
"#;

const CALLS_QUERY: &str = r#"
SELECT
    Z_PK AS rowid,
    ZUNIQUE_ID AS unique_id,
    ZADDRESS AS address,
    ZNAME AS name,
    ZDATE AS date,
    ZDURATION AS duration,
    ZORIGINATED AS originated,
    ZANSWERED AS answered,
    ZCALLTYPE AS call_type,
    ZSERVICE_PROVIDER AS service_provider
FROM ZCALLRECORD
WHERE ZUNIQUE_ID IS NOT NULL AND Z_PK > ?1
ORDER BY Z_PK ASC
LIMIT ?2
"#;

// Contacts are edited in place, so rows are ordered by their Core Data
// modification time rather than Z_PK. Phone numbers and e-mail addresses
// are folded into JSON arrays per contact.
const CONTACTS_QUERY: &str = r#"
SELECT
    r.Z_PK AS rowid,
    r.ZFIRSTNAME AS first_name,
    r.ZLASTNAME AS last_name,
    r.ZORGANIZATION AS organization,
    r.ZJOBTITLE AS job_title,
    r.ZNICKNAME AS nickname,
    r.ZMODIFICATIONDATE AS modified_at,
    (SELECT json_group_array(json_object('number', p.ZFULLNUMBER, 'label', p.ZLABEL))
       FROM ZABCDPHONENUMBER p
      WHERE p.ZOWNER = r.Z_PK AND p.ZFULLNUMBER IS NOT NULL) AS phones,
    (SELECT json_group_array(json_object('address', e.ZADDRESS, 'label', e.ZLABEL))
       FROM ZABCDEMAILADDRESS e
      WHERE e.ZOWNER = r.Z_PK AND e.ZADDRESS IS NOT NULL) AS emails
FROM ZABCDRECORD r
WHERE (r.ZFIRSTNAME IS NOT NULL OR r.ZLASTNAME IS NOT NULL)
  AND r.ZMODIFICATIONDATE > ?1
ORDER BY r.ZMODIFICATIONDATE ASC, r.Z_PK ASC
LIMIT ?2
"#;

impl SourcePreset {
    pub fn query(self) -> &'static str {
        match self {
            SourcePreset::Messages => MESSAGES_QUERY,
            SourcePreset::Calls => CALLS_QUERY,
            SourcePreset::Contacts => CONTACTS_QUERY,
        }
    }

    pub fn id_column(self) -> &'static str {
        "rowid"
    }

    pub fn watermark_column(self) -> &'static str {
        match self {
            SourcePreset::Messages | SourcePreset::Calls => "rowid",
            SourcePreset::Contacts => "modified_at",
        }
    }

    /// Location of the database relative to the user's home directory.
    pub fn default_relative_path(self) -> &'static str {
        match self {
            SourcePreset::Messages => "Library/Messages/chat.db",
            SourcePreset::Calls => {
                "Library/Application Support/CallHistoryDB/CallHistory.storedata"
            }
            SourcePreset::Contacts => "Library/Application Support/AddressBook/AddressBook-v22.abcddb",
        }
    }
}

/// Detector over a SQLite file opened read-only for each pass.
#[derive(Debug, Clone)]
pub struct SqliteDetector {
    name: String,
    path: PathBuf,
    query: String,
    id_column: String,
    watermark_column: String,
    busy_timeout: Duration,
}

impl SqliteDetector {
    /// Detects new rows of `table` keyed by `id_column`. An empty `columns`
    /// selects every column.
    pub fn for_table(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        table: &str,
        id_column: &str,
        columns: &[String],
    ) -> Self {
        Self::for_modified_table(name, path, table, id_column, id_column, columns)
    }

    /// Detects rows of `table` whose `watermark_column` (an INTEGER or REAL
    /// modification marker) moved past the watermark. Rows stay keyed by
    /// `id_column`, so an edited row replaces its earlier version downstream.
    pub fn for_modified_table(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        table: &str,
        id_column: &str,
        watermark_column: &str,
        columns: &[String],
    ) -> Self {
        let id = quote_ident(id_column);
        let mark = quote_ident(watermark_column);
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            let mut cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            if watermark_column != id_column && !columns.iter().any(|c| c == watermark_column) {
                cols.insert(0, mark.clone());
            }
            if !columns.iter().any(|c| c == id_column) {
                cols.insert(0, id.clone());
            }
            cols.join(", ")
        };
        let order = if watermark_column == id_column {
            format!("{id} ASC")
        } else {
            format!("{mark} ASC, {id} ASC")
        };
        let query = format!(
            "SELECT {projection} FROM {} WHERE {mark} > ?1 ORDER BY {order} LIMIT ?2",
            quote_ident(table)
        );
        Self::for_query(name, path, query, id_column).with_watermark_column(watermark_column)
    }

    /// Detects rows of a custom SELECT taking `?1` (watermark) and `?2`
    /// (limit). The result must contain `id_column`.
    pub fn for_query(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        query: impl Into<String>,
        id_column: &str,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            query: query.into(),
            id_column: id_column.to_string(),
            watermark_column: id_column.to_string(),
            busy_timeout: Duration::from_millis(250),
        }
    }

    pub fn for_preset(name: impl Into<String>, path: impl Into<PathBuf>, preset: SourcePreset) -> Self {
        Self::for_query(name, path, preset.query(), preset.id_column())
            .with_watermark_column(preset.watermark_column())
    }

    /// Orders detection by `column` instead of the id column. The query must
    /// filter and sort on the same column.
    pub fn with_watermark_column(mut self, column: &str) -> Self {
        self.watermark_column = column.to_string();
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the source read-only to confirm it is reachable and the query
    /// compiles against its schema.
    pub fn verify(&self) -> Result<(), DetectError> {
        let conn = self.open()?;
        conn.prepare(&self.query).map_err(classify)?;
        Ok(())
    }

    fn open(&self) -> Result<Connection, DetectError> {
        if !self.path.is_file() {
            return Err(DetectError::Unavailable(format!(
                "{} does not exist",
                self.path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(classify)?;
        conn.busy_timeout(self.busy_timeout).map_err(classify)?;
        Ok(conn)
    }

    fn query_after(&self, after: Watermark, limit: usize) -> Result<Vec<ChangeRecord>, DetectError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&self.query).map_err(classify)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        for (role, column) in [("id", &self.id_column), ("watermark", &self.watermark_column)] {
            if !columns.iter().any(|c| c == column) {
                return Err(DetectError::Failed(format!(
                    "query for source '{}' does not return {} column '{}'",
                    self.name, role, column
                )));
            }
        }

        let mut rows = stmt
            .query(params![after, limit as i64])
            .map_err(classify)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(row.get::<_, SqlValue>(idx).map_err(classify)?);
            }
            let record = ChangeRecord::from_sqlite_row(
                &self.name,
                &self.id_column,
                &self.watermark_column,
                &columns,
                values,
            )
            .map_err(|err| DetectError::Failed(format!("{err:#}")))?;
            records.push(record);
        }
        if records.len() == limit && self.watermark_column != self.id_column {
            drop_trailing_ties(&self.name, &mut records);
        }
        Ok(records)
    }
}

/// A full batch may have cut a group of rows sharing one watermark in half.
/// The next pass starts strictly after the batch's highest watermark, so the
/// rest of that group would be skipped. Hold the whole group back unless it
/// fills the batch by itself.
fn drop_trailing_ties(source_name: &str, records: &mut Vec<ChangeRecord>) {
    let Some(last) = records.last().map(|r| r.watermark) else {
        return;
    };
    let keep = records
        .iter()
        .rposition(|r| r.watermark != last)
        .map_or(0, |idx| idx + 1);
    if keep == 0 {
        tracing::warn!(
            source = source_name,
            watermark = %last,
            "every row in the batch shares one watermark; raise batch_limit if rows are skipped"
        );
        return;
    }
    records.truncate(keep);
}

impl SourceDetector for SqliteDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, after: Watermark, limit: usize) -> DetectOutcome {
        match self.query_after(after, limit) {
            Ok(records) => {
                let candidate = records.iter().fold(after, |mark, r| mark.max(r.watermark));
                if records.is_empty() {
                    DetectOutcome::NoChanges
                } else {
                    DetectOutcome::Changes { records, candidate }
                }
            }
            Err(err) => DetectOutcome::RetryLater(err),
        }
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

fn classify(err: rusqlite::Error) -> DetectError {
    match &err {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            DetectError::Busy(err.to_string())
        }
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::CannotOpen => {
            DetectError::Unavailable(err.to_string())
        }
        _ => DetectError::Failed(err.to_string()),
    }
}

fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
