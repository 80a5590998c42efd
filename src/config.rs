// ABOUTME: Pipeline configuration loaded once from a TOML file at startup
// ABOUTME: Defines sources, destination, secret backend and delivery/watch tuning

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tosh_capture::{SourcePreset, SqliteDetector};

use crate::utils::{expand_home, sanitize_url, validate_identifier};

/// Default location of the configuration file, before `~` expansion.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/tosh/sync.toml";

/// Complete pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// SQLite file holding the durable queue and cursors
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
    /// JSON health file read by status tooling
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,
    /// Upper bound on graceful shutdown after a signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    /// PostgreSQL connection string; the password may come from `secret`
    pub url: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Table receiving rows of sources without a `target_table`
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub allow_self_signed_certs: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub secret: SecretConfig,
}

/// Where the destination password comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum SecretConfig {
    /// macOS keychain generic password
    Keychain {
        #[serde(default = "default_keychain_service")]
        service: String,
        #[serde(default = "default_keychain_account")]
        account: String,
    },
    Env {
        var: String,
    },
    File {
        path: PathBuf,
    },
    /// HashiCorp Vault KV v2 secret
    Vault {
        address: String,
        path: String,
        #[serde(default = "default_vault_field")]
        field: String,
        #[serde(default = "default_vault_token_env")]
        token_env: String,
    },
    /// Password is embedded in the URL or not required
    #[default]
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliverySettings {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1_000,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000, // 5 minutes
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchSettings {
    pub debounce_ms: u64,
    pub fallback_interval_secs: u64,
    pub file_poll_interval_ms: u64,
    /// Maximum records read per detection pass
    pub batch_limit: usize,
    pub busy_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            fallback_interval_secs: 60,
            file_poll_interval_ms: 500,
            batch_limit: 500,
            busy_timeout_ms: 250,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

/// One monitored SQLite database.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    /// Database file; presets fall back to their standard macOS location
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub preset: Option<SourcePreset>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub id_column: Option<String>,
    /// INTEGER or REAL column that grows whenever a row changes, for tables
    /// edited in place. Defaults to the id column.
    #[serde(default)]
    pub watermark_column: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub target_table: Option<String>,
}

/// How a source selects its rows, resolved from [`SourceConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Preset(SourcePreset),
    Table {
        table: String,
        id_column: String,
        watermark_column: String,
        columns: Vec<String>,
    },
    Query {
        query: String,
        id_column: String,
        watermark_column: String,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> Result<SourceKind> {
        match (&self.preset, &self.table, &self.query) {
            (Some(_), None, None) if self.watermark_column.is_some() => bail!(
                "source '{}': presets define their own watermark; remove 'watermark_column'",
                self.name
            ),
            (Some(preset), None, None) => Ok(SourceKind::Preset(*preset)),
            (None, Some(table), None) => {
                let id_column = self.id_column.clone().unwrap_or_else(|| "rowid".to_string());
                Ok(SourceKind::Table {
                    table: table.clone(),
                    watermark_column: self
                        .watermark_column
                        .clone()
                        .unwrap_or_else(|| id_column.clone()),
                    id_column,
                    columns: self.columns.clone(),
                })
            }
            (None, None, Some(query)) => {
                let id_column = self.id_column.clone().with_context(|| {
                    format!("source '{}': 'query' requires 'id_column'", self.name)
                })?;
                Ok(SourceKind::Query {
                    query: query.clone(),
                    watermark_column: self
                        .watermark_column
                        .clone()
                        .unwrap_or_else(|| id_column.clone()),
                    id_column,
                })
            }
            (None, None, None) => bail!(
                "source '{}' needs one of 'preset', 'table' or 'query'",
                self.name
            ),
            _ => bail!(
                "source '{}' sets more than one of 'preset', 'table' and 'query'",
                self.name
            ),
        }
    }

    /// Database file for this source, with presets resolved against `$HOME`.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(expand_home(path));
        }
        match self.preset {
            Some(preset) => {
                let home = dirs::home_dir().context("Could not find home directory")?;
                Ok(home.join(preset.default_relative_path()))
            }
            None => bail!("source '{}' has no 'path'", self.name),
        }
    }

    /// Destination table for this source's rows.
    pub fn target_table<'a>(&'a self, destination: &'a DestinationConfig) -> &'a str {
        self.target_table.as_deref().unwrap_or(&destination.table)
    }

    pub fn build_detector(&self, watch: &WatchSettings) -> Result<SqliteDetector> {
        let path = self.resolved_path()?;
        let detector = match self.kind()? {
            SourceKind::Preset(preset) => SqliteDetector::for_preset(&self.name, path, preset),
            SourceKind::Table {
                table,
                id_column,
                watermark_column,
                columns,
            } => SqliteDetector::for_modified_table(
                &self.name,
                path,
                &table,
                &id_column,
                &watermark_column,
                &columns,
            ),
            SourceKind::Query {
                query,
                id_column,
                watermark_column,
            } => SqliteDetector::for_query(&self.name, path, query, &id_column)
                .with_watermark_column(&watermark_column),
        };
        Ok(detector.with_busy_timeout(Duration::from_millis(watch.busy_timeout_ms)))
    }
}

impl PipelineConfig {
    /// Load, expand and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_home(path);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!(
            "Loaded config from {} ({} sources, destination {})",
            path.display(),
            config.sources.len(),
            sanitize_url(&config.destination.url)
        );
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: PipelineConfig = toml::from_str(raw).context("Failed to parse TOML")?;
        config.queue_path = expand_home(&config.queue_path);
        config.status_path = expand_home(&config.status_path);
        if let SecretConfig::File { path } = &mut config.destination.secret {
            *path = expand_home(path);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("At least one [[sources]] entry is required");
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            validate_identifier(&source.name)
                .with_context(|| format!("Invalid source name '{}'", source.name))?;
            if !seen.insert(source.name.as_str()) {
                bail!("Duplicate source name '{}'", source.name);
            }
            source.kind()?;
            if let Some(table) = &source.target_table {
                validate_identifier(table)
                    .with_context(|| format!("Invalid target_table for source '{}'", source.name))?;
            }
            if source.path.is_none() && source.preset.is_none() {
                bail!("source '{}' has no 'path'", source.name);
            }
        }

        validate_identifier(&self.destination.schema).context("Invalid destination schema")?;
        validate_identifier(&self.destination.table).context("Invalid destination table")?;
        self.destination
            .url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| {
                anyhow::anyhow!(
                    "Invalid destination url '{}': {}",
                    sanitize_url(&self.destination.url),
                    e
                )
            })?;

        if self.delivery.batch_size == 0 {
            bail!("delivery.batch_size must be greater than 0");
        }
        if self.watch.batch_limit == 0 {
            bail!("watch.batch_limit must be greater than 0");
        }
        if self.delivery.backoff_base_ms > self.delivery.backoff_max_ms {
            bail!("delivery.backoff_base_ms must not exceed delivery.backoff_max_ms");
        }
        if self.watch.backoff_base_ms > self.watch.backoff_max_ms {
            bail!("watch.backoff_base_ms must not exceed watch.backoff_max_ms");
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("~/.tosh/queue.db")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("~/.tosh/health.json")
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "tosh_changes".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keychain_service() -> String {
    "tosh-comms-db".to_string()
}

fn default_keychain_account() -> String {
    "postgres".to_string()
}

fn default_vault_field() -> String {
    "password".to_string()
}

fn default_vault_token_env() -> String {
    "VAULT_TOKEN".to_string()
}
