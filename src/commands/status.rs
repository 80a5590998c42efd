use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tosh_capture::ChangeQueue;

use crate::config::PipelineConfig;
use crate::health::HealthFile;

/// Print health, queue depth and cursors.
pub async fn status(config: PipelineConfig, as_json: bool) -> Result<i32> {
    let health = HealthFile::load(&config.status_path)?;
    let queue = ChangeQueue::open(&config.queue_path)
        .with_context(|| format!("Failed to open change queue {}", config.queue_path.display()))?;
    let stats = queue.stats(Utc::now())?;
    let cursors = queue.cursor_store().list()?;

    if as_json {
        let report = json!({
            "health": health.overall(),
            "last_run": health.last_run,
            "sources": health.sources,
            "queue": stats,
            "cursors": cursors,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(0);
    }

    println!("Health: {}", health.overall());
    println!("Last run: {}", format_time(health.last_run));
    println!("Queue: {}", queue.path().display());
    println!();

    for source in &config.sources {
        let name = source.name.as_str();
        let queued = stats.sources.iter().find(|s| s.source_name == name);
        let cursor = cursors.iter().find(|c| c.source_name == name);
        println!("{}", name);
        println!(
            "  cursor:        {}",
            cursor.map_or("none".to_string(), |c| c.high_water_mark.to_string())
        );
        println!(
            "  pending:       {} ({} deferred)",
            queued.map_or(0, |s| s.pending),
            queued.map_or(0, |s| s.deferred)
        );
        println!("  dead-lettered: {}", queued.map_or(0, |s| s.dead_lettered));
        if let Some(entry) = health.sources.get(name) {
            println!(
                "  last success:  {} ({} rows, {} ms)",
                format_time(entry.last_success),
                entry.rows_synced,
                entry.duration_ms
            );
            if let Some(error) = &entry.last_error {
                println!(
                    "  last failure:  {}: {}",
                    format_time(entry.last_failure),
                    error
                );
            }
        }
    }

    let unknown: Vec<&str> = stats
        .sources
        .iter()
        .map(|s| s.source_name.as_str())
        .filter(|name| config.source(name).is_none())
        .collect();
    if !unknown.is_empty() {
        println!();
        println!(
            "Queue holds entries for unconfigured sources: {}",
            unknown.join(", ")
        );
    }
    Ok(0)
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
}
