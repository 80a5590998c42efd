use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tosh_capture::ChangeQueue;

use super::EXIT_PROBLEMS;
use crate::config::PipelineConfig;

#[derive(Args)]
pub struct DeadLetterArgs {
    #[command(subcommand)]
    command: DeadLetterCommands,
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List dead-lettered entries, oldest first
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Return dead-lettered entries to the pending queue
    Retry {
        /// Entry ids to requeue
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        entry_ids: Vec<i64>,
        /// Requeue every dead-lettered entry
        #[arg(long)]
        all: bool,
        /// With --all, only requeue entries of this source
        #[arg(long, requires = "all")]
        source: Option<String>,
    },
    /// Delete dead-lettered entries permanently
    Purge {
        /// Entry ids to delete
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        entry_ids: Vec<i64>,
        /// Delete every dead-lettered entry
        #[arg(long)]
        all: bool,
    },
}

pub async fn command(config: PipelineConfig, args: DeadLetterArgs) -> Result<i32> {
    let queue = ChangeQueue::open(&config.queue_path)
        .with_context(|| format!("Failed to open change queue {}", config.queue_path.display()))?;

    match args.command {
        DeadLetterCommands::List { limit, json } => list(&queue, limit, json),
        DeadLetterCommands::Retry {
            entry_ids,
            all,
            source,
        } => {
            if all {
                let count = queue.requeue_dead_letters(source.as_deref())?;
                match source {
                    Some(source) => println!("Requeued {} entries of source {}", count, source),
                    None => println!("Requeued {} entries", count),
                }
                return Ok(0);
            }
            let mut missing = 0;
            for entry_id in entry_ids {
                if queue.requeue_dead_letter(entry_id)? {
                    println!("Requeued entry {}", entry_id);
                } else {
                    missing += 1;
                    println!("Entry {} is not dead-lettered", entry_id);
                }
            }
            Ok(if missing == 0 { 0 } else { EXIT_PROBLEMS })
        }
        DeadLetterCommands::Purge { entry_ids, all } => {
            let count = if all {
                queue.purge_all_dead_letters()?
            } else {
                queue.purge_dead_letters(&entry_ids)?
            };
            tracing::info!("Purged {} dead-lettered entries", count);
            println!("Purged {} entries", count);
            Ok(0)
        }
    }
}

fn list(queue: &ChangeQueue, limit: usize, json: bool) -> Result<i32> {
    let entries = queue.list_dead_letters(limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }
    if entries.is_empty() {
        println!("No dead-lettered entries.");
        return Ok(0);
    }
    println!(
        "{:>8}  {:<16} {:>12} {:>8}  {:<25} ERROR",
        "ENTRY", "SOURCE", "RECORD", "ATTEMPTS", "DEAD-LETTERED"
    );
    for entry in entries {
        println!(
            "{:>8}  {:<16} {:>12} {:>8}  {:<25} {}",
            entry.entry_id,
            entry.source_name(),
            entry.source_record_id(),
            entry.attempts,
            entry
                .dead_lettered_at
                .map_or_else(String::new, |t| t.to_rfc3339()),
            entry.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(0)
}
