#![allow(dead_code)]

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tosh_capture::QueueEntry;
use tosh_sync::destination::{Destination, WriteError};
use tosh_sync::PipelineConfig;

/// In-memory destination keyed like the real table, with scripted failures.
#[derive(Default)]
pub struct FakeDestination {
    rows: Mutex<BTreeMap<(String, i64), Value>>,
    writes: Mutex<Vec<(String, Vec<i64>)>>,
    scripted: Mutex<HashMap<String, VecDeque<WriteError>>>,
    rejected: Mutex<HashSet<(String, i64)>>,
    unavailable: AtomicBool,
}

impl FakeDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next write for `source` with `err`.
    pub fn fail_next(&self, source: &str, err: WriteError) {
        self.scripted
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .push_back(err);
    }

    /// Permanently reject any batch containing this record.
    pub fn reject(&self, source: &str, record_id: i64) {
        self.rejected
            .lock()
            .unwrap()
            .insert((source.to_string(), record_id));
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn record_ids(&self, source: &str) -> Vec<i64> {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(name, _)| name == source)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn payload(&self, source: &str, record_id: i64) -> Option<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(&(source.to_string(), record_id))
            .cloned()
    }

    /// Record ids of every committed write for `source`, in commit order.
    pub fn write_order(&self, source: &str) -> Vec<i64> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == source)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}

#[async_trait]
impl Destination for FakeDestination {
    async fn write_batch(&self, source_name: &str, entries: &[QueueEntry]) -> Result<(), WriteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WriteError::transient("connection refused"));
        }
        if let Some(err) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(source_name)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        {
            let rejected = self.rejected.lock().unwrap();
            if let Some(entry) = entries
                .iter()
                .find(|e| rejected.contains(&(source_name.to_string(), e.source_record_id())))
            {
                return Err(WriteError::permanent(format!(
                    "invalid input syntax for record {}",
                    entry.source_record_id()
                )));
            }
        }

        let mut rows = self.rows.lock().unwrap();
        for entry in entries {
            rows.insert(
                (source_name.to_string(), entry.source_record_id()),
                Value::Object(entry.record.payload.clone()),
            );
        }
        self.writes.lock().unwrap().push((
            source_name.to_string(),
            entries.iter().map(QueueEntry::source_record_id).collect(),
        ));
        Ok(())
    }
}

/// Create a source database with an append-only `events` table.
pub fn create_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.db"));
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL, body TEXT)",
    )
    .unwrap();
    path
}

pub fn insert_events(path: &Path, ids: impl IntoIterator<Item = i64>) {
    let conn = Connection::open(path).unwrap();
    for id in ids {
        conn.execute(
            "INSERT INTO events (id, kind, body) VALUES (?1, 'message', ?2)",
            params![id, format!("event {id}")],
        )
        .unwrap();
    }
}

/// A pipeline config over `sources` with short timings for tests.
pub fn test_config(dir: &Path, sources: &[(&str, &Path)]) -> PipelineConfig {
    let mut raw = format!(
        r#"
queue_path = '{}'
status_path = '{}'
shutdown_grace_secs = 5

[destination]
url = "postgresql://tosh@localhost:5432/comms"

[delivery]
batch_size = 100
poll_interval_ms = 20
max_retries = 3
backoff_base_ms = 5
backoff_max_ms = 20

[watch]
debounce_ms = 10
fallback_interval_secs = 1
file_poll_interval_ms = 20
batch_limit = 50
backoff_base_ms = 10
backoff_max_ms = 50
"#,
        dir.join("queue.db").display(),
        dir.join("health.json").display(),
    );
    for (name, path) in sources {
        raw.push_str(&format!(
            r#"
[[sources]]
name = "{}"
path = '{}'
table = "events"
id_column = "id"
"#,
            name,
            path.display()
        ));
    }
    PipelineConfig::from_toml(&raw).unwrap()
}
