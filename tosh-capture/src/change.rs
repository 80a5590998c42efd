use anyhow::{anyhow, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::watermark::Watermark;

/// One row detected in a source database.
///
/// `(source_name, source_record_id)` is the idempotency key used by the
/// destination; the same row detected twice yields the same key.
/// `watermark` orders the row within its source. It equals the record id for
/// append-only sources and is a modification time for sources whose rows are
/// edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub source_name: String,
    pub source_record_id: i64,
    pub watermark: Watermark,
    pub payload: Map<String, Value>,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(source_name: impl Into<String>, source_record_id: i64, payload: Map<String, Value>) -> Self {
        Self {
            source_name: source_name.into(),
            source_record_id,
            watermark: Watermark::Integer(source_record_id),
            payload,
            detected_at: Utc::now(),
        }
    }

    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = watermark;
        self
    }

    /// Builds a record from a SQLite row already split into column names and values.
    ///
    /// The id column must hold an INTEGER and the watermark column an INTEGER
    /// or REAL. Anything else means the source does not have the ordering the
    /// detector relies on.
    pub fn from_sqlite_row(
        source_name: &str,
        id_column: &str,
        watermark_column: &str,
        columns: &[String],
        values: Vec<SqlValue>,
    ) -> Result<Self> {
        let mut payload = Map::with_capacity(columns.len());
        let mut record_id = None;
        let mut watermark = None;
        for (column, value) in columns.iter().zip(values) {
            if column == id_column {
                record_id = match &value {
                    SqlValue::Integer(id) => Some(*id),
                    other => {
                        return Err(anyhow!(
                            "id column '{id_column}' of source '{source_name}' holds a non-integer value: {other:?}"
                        ))
                    }
                };
            }
            if column == watermark_column {
                watermark = match &value {
                    SqlValue::Integer(mark) => Some(Watermark::Integer(*mark)),
                    SqlValue::Real(mark) if mark.is_finite() => Some(Watermark::Real(*mark)),
                    other => {
                        return Err(anyhow!(
                            "watermark column '{watermark_column}' of source '{source_name}' holds a non-numeric value: {other:?}"
                        ))
                    }
                };
            }
            let json = sqlite_value_to_json(&value)
                .with_context(|| format!("failed to convert column '{column}' to JSON"))?;
            payload.insert(column.clone(), json);
        }
        let id = record_id.ok_or_else(|| {
            anyhow!("id column '{id_column}' missing from rows of source '{source_name}'")
        })?;
        let watermark = watermark.ok_or_else(|| {
            anyhow!("watermark column '{watermark_column}' missing from rows of source '{source_name}'")
        })?;
        Ok(Self::new(source_name, id, payload).with_watermark(watermark))
    }
}

/// Convert a single SQLite value to JSON.
///
/// BLOBs become `{"_type": "blob", "data": "<base64>"}` so they stay
/// distinguishable from TEXT. Non-finite REALs are stored as strings.
pub fn sqlite_value_to_json(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Null => Ok(Value::Null),
        SqlValue::Integer(i) => Ok(Value::Number((*i).into())),
        SqlValue::Real(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(*f)
                    .map(Value::Number)
                    .ok_or_else(|| anyhow!("failed to convert float {f} to JSON number"))
            } else {
                Ok(Value::String(f.to_string()))
            }
        }
        SqlValue::Text(s) => Ok(Value::String(s.clone())),
        SqlValue::Blob(b) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(b);
            Ok(serde_json::json!({
                "_type": "blob",
                "data": encoded
            }))
        }
    }
}
