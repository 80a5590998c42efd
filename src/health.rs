// ABOUTME: Health status file recording the last delivery outcome per source
// ABOUTME: JSON document read by `tosh-sync status` and external status displays

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Last known delivery outcome for one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub last_success: Option<DateTime<Utc>>,
    /// Rows written by the last successful delivery
    pub rows_synced: u64,
    pub duration_ms: u64,
    pub correlation_id: Option<String>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_correlation_id: Option<String>,
}

impl SourceHealth {
    fn is_failing(&self) -> bool {
        match (self.last_success, self.last_failure) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(success), Some(failure)) => failure > success,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallHealth {
    Ok,
    Degraded,
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallHealth::Ok => write!(f, "OK"),
            OverallHealth::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// Contents of the health file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthFile {
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceHealth>,
}

impl HealthFile {
    /// Load from disk; a missing file is an empty history.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read health file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse health file {}", path.display()))
    }

    /// Write atomically through a temporary file in the same directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create health directory {}", parent.display())
            })?;
        }
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize health status")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write health file {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace health file {}", path.display()))?;
        Ok(())
    }

    /// OK when something has run and no source's last failure is newer than
    /// its last success.
    pub fn overall(&self) -> OverallHealth {
        if self.last_run.is_none() || self.sources.values().any(SourceHealth::is_failing) {
            OverallHealth::Degraded
        } else {
            OverallHealth::Ok
        }
    }

    pub fn record_success(
        &mut self,
        source: &str,
        rows: u64,
        duration: Duration,
        correlation_id: &str,
    ) {
        let now = Utc::now();
        let entry = self.sources.entry(source.to_string()).or_default();
        entry.last_success = Some(now);
        entry.rows_synced = rows;
        entry.duration_ms = duration.as_millis() as u64;
        entry.correlation_id = Some(correlation_id.to_string());
        self.last_run = Some(now);
    }

    pub fn record_failure(&mut self, source: &str, error: &str, correlation_id: &str) {
        let now = Utc::now();
        let entry = self.sources.entry(source.to_string()).or_default();
        entry.last_failure = Some(now);
        entry.last_error = Some(error.to_string());
        entry.error_correlation_id = Some(correlation_id.to_string());
        self.last_run = Some(now);
    }
}

/// Shared writer for the health file used by the delivery engine.
pub struct HealthRecorder {
    path: PathBuf,
    state: Mutex<HealthFile>,
}

impl HealthRecorder {
    /// Start from the existing file; an unreadable one is replaced.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match HealthFile::load(&path) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Ignoring unreadable health file: {:#}", e);
                HealthFile::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_success(
        &self,
        source: &str,
        rows: u64,
        duration: Duration,
        correlation_id: &str,
    ) -> Result<()> {
        self.update(|state| state.record_success(source, rows, duration, correlation_id))
    }

    pub fn record_failure(&self, source: &str, error: &str, correlation_id: &str) -> Result<()> {
        self.update(|state| state.record_failure(source, error, correlation_id))
    }

    pub fn snapshot(&self) -> HealthFile {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut HealthFile)) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("health state lock poisoned"))?;
        apply(&mut state);
        state.save(&self.path)
    }
}
