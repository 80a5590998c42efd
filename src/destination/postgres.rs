// ABOUTME: PostgreSQL destination - upserts change records into JSONB tables
// ABOUTME: Uses INSERT ... ON CONFLICT (source_name, source_record_id) DO UPDATE

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tosh_capture::QueueEntry;

use super::{Destination, WriteError};
use crate::config::PipelineConfig;
use crate::postgres::{connect, connect_with_retry, ConnectionSettings};
use crate::utils::quote_ident;

/// Columns written per row, in placeholder order.
const COLUMNS: [&str; 4] = ["source_name", "source_record_id", "payload", "detected_at"];

/// Rows per INSERT statement; 4 params per row keeps well under 65535.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

/// Writes change records to PostgreSQL, one transaction per batch.
///
/// The connection is opened lazily and replaced once it reports closed, so a
/// restarted server or tunnel only costs one failed (transient) batch.
pub struct PostgresDestination {
    settings: ConnectionSettings,
    schema: String,
    default_table: String,
    tables: HashMap<String, String>,
    client: Mutex<Option<Client>>,
}

impl PostgresDestination {
    pub fn new(settings: ConnectionSettings, schema: &str, default_table: &str) -> Self {
        Self {
            settings,
            schema: schema.to_string(),
            default_table: default_table.to_string(),
            tables: HashMap::new(),
            client: Mutex::new(None),
        }
    }

    pub fn from_config(config: &PipelineConfig, settings: ConnectionSettings) -> Self {
        let mut destination = Self::new(
            settings,
            &config.destination.schema,
            &config.destination.table,
        );
        for source in &config.sources {
            if let Some(table) = &source.target_table {
                destination
                    .tables
                    .insert(source.name.clone(), table.clone());
            }
        }
        destination
    }

    /// Route a source's rows to a dedicated table.
    pub fn with_table(mut self, source_name: &str, table: &str) -> Self {
        self.tables
            .insert(source_name.to_string(), table.to_string());
        self
    }

    pub fn table_for(&self, source_name: &str) -> &str {
        self.tables
            .get(source_name)
            .map(String::as_str)
            .unwrap_or(&self.default_table)
    }

    fn all_tables(&self) -> BTreeSet<&str> {
        let mut tables: BTreeSet<&str> = self.tables.values().map(String::as_str).collect();
        tables.insert(self.default_table.as_str());
        tables
    }

    /// Create the schema and every target table with its indexes.
    pub async fn ensure_tables(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        let client = Self::ensure_connected(&self.settings, &mut guard, true).await?;

        client
            .execute(
                &format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
                &[],
            )
            .await
            .with_context(|| format!("Failed to create schema '{}'", self.schema))?;

        for table in self.all_tables() {
            for statement in create_table_statements(&self.schema, table) {
                client
                    .execute(&statement, &[])
                    .await
                    .with_context(|| format!("Failed to prepare table {}.{}", self.schema, table))?;
            }
            tracing::info!("Destination table {}.{} is ready", self.schema, table);
        }
        Ok(())
    }

    /// Batch writes connect once and let the delivery engine back off;
    /// setup retries a few times itself.
    async fn ensure_connected<'a>(
        settings: &ConnectionSettings,
        slot: &'a mut Option<Client>,
        retry: bool,
    ) -> Result<&'a mut Client> {
        if slot.as_ref().map_or(true, |client| client.is_closed()) {
            if slot.is_some() {
                tracing::info!("Destination connection closed; reconnecting");
            }
            let client = if retry {
                connect_with_retry(settings).await?
            } else {
                connect(settings).await?
            };
            *slot = Some(client);
        }
        slot.as_mut()
            .context("destination connection missing after connect")
    }
}

#[async_trait]
impl Destination for PostgresDestination {
    async fn prepare(&self) -> Result<()> {
        self.ensure_tables().await
    }

    async fn write_batch(
        &self,
        source_name: &str,
        entries: &[QueueEntry],
    ) -> Result<(), WriteError> {
        if entries.is_empty() {
            return Ok(());
        }
        let table = self.table_for(source_name);

        let mut guard = self.client.lock().await;
        let result = match Self::ensure_connected(&self.settings, &mut guard, false).await {
            Ok(client) => upsert_entries(client, &self.schema, table, entries).await,
            Err(e) => Err(e),
        };

        if result.is_err() && guard.as_ref().map_or(false, |client| client.is_closed()) {
            *guard = None;
        }

        match result {
            Ok(rows) => {
                tracing::debug!(
                    "Upserted {} rows for source '{}' into {}.{}",
                    rows,
                    source_name,
                    self.schema,
                    table
                );
                Ok(())
            }
            Err(e) => Err(WriteError::from_anyhow(&e)),
        }
    }
}

/// Upsert all entries in one transaction, chunked by statement size.
async fn upsert_entries(
    client: &mut Client,
    schema: &str,
    table: &str,
    entries: &[QueueEntry],
) -> Result<u64> {
    let tx = client
        .transaction()
        .await
        .context("Failed to begin transaction")?;

    let mut affected = 0u64;
    for chunk in entries.chunks(MAX_ROWS_PER_STATEMENT) {
        let query = build_upsert_query(schema, table, chunk.len());
        let payloads: Vec<Value> = chunk
            .iter()
            .map(|entry| Value::Object(entry.record.payload.clone()))
            .collect();

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * COLUMNS.len());
        for (entry, payload) in chunk.iter().zip(&payloads) {
            params.push(&entry.record.source_name);
            params.push(&entry.record.source_record_id);
            params.push(payload);
            params.push(&entry.record.detected_at);
        }

        affected += tx
            .execute(&query, &params)
            .await
            .with_context(|| format!("Failed to upsert batch into {}.{}", schema, table))?;
    }

    tx.commit().await.context("Failed to commit batch")?;
    Ok(affected)
}

/// Build the upsert for `num_rows` records.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("source_name", "source_record_id", "payload", "detected_at")
/// VALUES ($1, $2, $3, $4), ($5, $6, $7, $8), ...
/// ON CONFLICT ("source_name", "source_record_id") DO UPDATE SET
///   "payload" = EXCLUDED."payload",
///   "detected_at" = EXCLUDED."detected_at",
///   "synced_at" = NOW()
/// ```
fn build_upsert_query(schema: &str, table: &str, num_rows: usize) -> String {
    let quoted_columns: Vec<String> = COLUMNS.iter().map(|c| quote_ident(c)).collect();

    let num_cols = COLUMNS.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {}.{} ({}) VALUES {} \
         ON CONFLICT (\"source_name\", \"source_record_id\") DO UPDATE SET \
         \"payload\" = EXCLUDED.\"payload\", \
         \"detected_at\" = EXCLUDED.\"detected_at\", \
         \"synced_at\" = NOW()",
        quote_ident(schema),
        quote_ident(table),
        quoted_columns.join(", "),
        value_rows.join(", ")
    )
}

/// DDL for one destination table: the table plus a GIN index on `payload`
/// and a `synced_at` index for recency queries.
fn create_table_statements(schema: &str, table: &str) -> Vec<String> {
    let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {qualified} (
                source_name TEXT NOT NULL,
                source_record_id BIGINT NOT NULL,
                payload JSONB NOT NULL,
                detected_at TIMESTAMPTZ NOT NULL,
                synced_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (source_name, source_record_id)
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {qualified} USING GIN (payload)",
            quote_ident(&format!("idx_{table}_payload"))
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {qualified} (synced_at)",
            quote_ident(&format!("idx_{table}_synced"))
        ),
    ]
}
