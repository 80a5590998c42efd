use anyhow::Result;

use super::EXIT_PROBLEMS;
use crate::config::PipelineConfig;
use crate::pipeline::Pipeline;
use crate::watch::PassOutcome;

/// One detection pass per selected source, then drain the queue.
pub async fn once(config: PipelineConfig, sources: Vec<String>) -> Result<i32> {
    let pipeline = Pipeline::from_config(config).await?;
    let summary = pipeline.run_once(&sources).await?;

    for (name, outcome) in &summary.detection {
        match outcome {
            PassOutcome::Enqueued {
                detected,
                enqueued,
                candidate,
            } => println!(
                "{}: detected {} record(s), {} new or updated, up to watermark {}",
                name, detected, enqueued, candidate
            ),
            PassOutcome::NoChanges => println!("{}: no new records", name),
            PassOutcome::RetryLater(e) => println!("{}: skipped ({})", name, e),
        }
    }

    let delivery = &summary.delivery;
    println!(
        "Delivered {}, retry scheduled {}, dead-lettered {}, deferred {}",
        delivery.delivered, delivery.retried, delivery.dead_lettered, delivery.deferred
    );
    if delivery.paused {
        println!("Delivery paused: destination unavailable, remaining records stay queued");
    }

    if summary.is_clean() {
        Ok(0)
    } else {
        Ok(EXIT_PROBLEMS)
    }
}
