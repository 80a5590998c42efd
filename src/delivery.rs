// ABOUTME: Delivery engine - drains the durable queue into the destination
// ABOUTME: Groups by source, acknowledges with cursor advance, retries with backoff, dead-letters

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::Instrument;
use tosh_capture::queue::QueueCorrupt;
use tosh_capture::{ChangeQueue, QueueEntry};

use crate::config::DeliverySettings;
use crate::destination::{Destination, WriteError};
use crate::health::HealthRecorder;
use crate::utils::correlation_id;

/// Tuning for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Maximum entries pulled per cycle
    pub batch_size: usize,
    /// Sleep between cycles when the queue has nothing ready
    pub poll_interval: Duration,
    /// Failed attempts tolerated before an entry is dead-lettered
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig::from(&DeliverySettings::default())
    }
}

impl From<&DeliverySettings> for DeliveryConfig {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

/// Outcome of one or more delivery cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Entries marked failed and scheduled for another attempt
    pub retried: usize,
    pub dead_lettered: usize,
    /// Entries skipped because their source is backing off
    pub deferred: usize,
    /// Delivery stopped early because the destination looks unavailable
    pub paused: bool,
}

impl DeliveryReport {
    fn is_quiet(&self) -> bool {
        self.delivered == 0 && self.retried == 0 && self.dead_lettered == 0
    }

    pub fn merge(&mut self, other: &DeliveryReport) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.deferred = other.deferred;
        self.paused |= other.paused;
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`. `attempt` counts failures
/// so far, starting at 1.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// Adds up to 10% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Drains the shared queue into a [`Destination`].
///
/// One engine serializes all writes, so per-source order follows queue
/// order. A group is acknowledged, and its source cursor advanced, only
/// after the destination committed it.
pub struct DeliveryEngine {
    queue: ChangeQueue,
    destination: Arc<dyn Destination>,
    config: DeliveryConfig,
    health: Option<Arc<HealthRecorder>>,
}

impl DeliveryEngine {
    pub fn new(
        queue: ChangeQueue,
        destination: Arc<dyn Destination>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            queue,
            destination,
            config,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthRecorder>) -> Self {
        self.health = Some(health);
        self
    }

    /// Deliver one batch of ready entries.
    pub async fn run_once(&self) -> Result<DeliveryReport> {
        let correlation_id = correlation_id();
        let span = tracing::info_span!("delivery", correlation_id = %correlation_id);
        async {
            let report = self.deliver_batch(&correlation_id).await?;
            if !report.is_quiet() || report.paused {
                tracing::info!(
                    delivered = report.delivered,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    deferred = report.deferred,
                    paused = report.paused,
                    "delivery cycle finished"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Run cycles until nothing is ready or delivery pauses.
    pub async fn drain(&self) -> Result<DeliveryReport> {
        let mut total = DeliveryReport::default();
        loop {
            let report = self.run_once().await?;
            total.merge(&report);
            if report.is_quiet() || report.paused {
                return Ok(total);
            }
        }
    }

    /// Run until `shutdown` fires. Returns an error only for queue storage
    /// failures, which are fatal.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting delivery engine with batch_size={}, max_retries={}, poll_interval={:?}",
            self.config.batch_size,
            self.config.max_retries,
            self.config.poll_interval
        );
        let mut consecutive_pauses = 0u32;

        loop {
            let pause = tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping delivery engine");
                    break;
                }
                result = self.run_once() => match result {
                    Ok(report) if report.paused => {
                        consecutive_pauses = consecutive_pauses.saturating_add(1);
                        let delay = with_jitter(backoff_delay(
                            self.config.backoff_base,
                            self.config.backoff_max,
                            consecutive_pauses,
                        ));
                        tracing::warn!("Destination unavailable, pausing delivery for {:?}", delay);
                        delay
                    }
                    Ok(report) if report.is_quiet() => {
                        consecutive_pauses = 0;
                        self.config.poll_interval
                    }
                    Ok(_) => {
                        consecutive_pauses = 0;
                        Duration::ZERO
                    }
                    Err(e) if e.downcast_ref::<QueueCorrupt>().is_some() => {
                        tracing::error!("Queue storage failure: {:#}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!("Delivery cycle failed: {:#}", e);
                        self.config.poll_interval
                    }
                },
            };

            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping delivery engine");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
        Ok(())
    }

    async fn deliver_batch(&self, correlation_id: &str) -> Result<DeliveryReport> {
        let now = Utc::now();
        let mut report = DeliveryReport {
            deferred: self
                .queue
                .stats(now)?
                .sources
                .iter()
                .map(|s| s.deferred as usize)
                .sum(),
            ..Default::default()
        };

        let batch = self.queue.peek_ready_batch(self.config.batch_size, now)?;
        if batch.is_empty() {
            return Ok(report);
        }

        let mut groups: BTreeMap<String, Vec<QueueEntry>> = BTreeMap::new();
        for entry in batch {
            groups
                .entry(entry.record.source_name.clone())
                .or_default()
                .push(entry);
        }

        for (source, entries) in &groups {
            let started = Instant::now();
            match self.destination.write_batch(source, entries).await {
                Ok(()) => {
                    self.acknowledge(source, entries)?;
                    report.delivered += entries.len();
                    self.record_success(source, entries.len(), started.elapsed(), correlation_id);
                }
                Err(err) if err.is_permanent() => {
                    tracing::warn!(
                        source = %source,
                        entries = entries.len(),
                        error = %err,
                        "batch rejected, isolating records"
                    );
                    if !self
                        .isolate(source, entries, &mut report, correlation_id)
                        .await?
                    {
                        report.paused = true;
                        break;
                    }
                }
                Err(err) => {
                    self.fail_transient(source, entries, &err, &mut report)?;
                    self.record_failure(source, &err.message, correlation_id);
                    report.paused = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Write records one at a time to separate rejected ones from good ones.
    /// Returns false if the destination became unavailable midway.
    async fn isolate(
        &self,
        source: &str,
        entries: &[QueueEntry],
        report: &mut DeliveryReport,
        correlation_id: &str,
    ) -> Result<bool> {
        let started = Instant::now();
        let mut delivered = 0usize;
        let mut rejected = None;

        for (idx, entry) in entries.iter().enumerate() {
            match self
                .destination
                .write_batch(source, std::slice::from_ref(entry))
                .await
            {
                Ok(()) => {
                    self.acknowledge(source, std::slice::from_ref(entry))?;
                    delivered += 1;
                }
                Err(err) if err.is_permanent() => {
                    tracing::error!(
                        source = %source,
                        source_record_id = entry.source_record_id(),
                        entry_id = entry.entry_id,
                        attempts = entry.attempts + 1,
                        error = %err.message,
                        "record dead-lettered"
                    );
                    self.queue.dead_letter(entry.entry_id, &err.message)?;
                    report.dead_lettered += 1;
                    rejected = Some(err.message);
                }
                Err(err) => {
                    self.fail_transient(source, &entries[idx..], &err, report)?;
                    self.record_failure(source, &err.message, correlation_id);
                    report.delivered += delivered;
                    return Ok(false);
                }
            }
        }

        report.delivered += delivered;
        if let Some(message) = rejected {
            self.record_failure(source, &message, correlation_id);
        }
        if delivered > 0 {
            self.record_success(source, delivered, started.elapsed(), correlation_id);
        }
        Ok(true)
    }

    fn acknowledge(&self, source: &str, entries: &[QueueEntry]) -> Result<()> {
        let removed = self.queue.acknowledge_and_advance(source, entries)?;
        if removed < entries.len() as u64 {
            tracing::debug!(
                source = %source,
                kept = entries.len() as u64 - removed,
                "entries refreshed during delivery stay queued"
            );
        }
        Ok(())
    }

    fn fail_transient(
        &self,
        source: &str,
        entries: &[QueueEntry],
        err: &WriteError,
        report: &mut DeliveryReport,
    ) -> Result<()> {
        let now = Utc::now();
        for entry in entries {
            let failures = entry.attempts + 1;
            if failures > self.config.max_retries {
                tracing::error!(
                    source = %source,
                    source_record_id = entry.source_record_id(),
                    entry_id = entry.entry_id,
                    attempts = failures,
                    error = %err.message,
                    "retries exhausted, record dead-lettered"
                );
                self.queue.dead_letter(entry.entry_id, &err.message)?;
                report.dead_lettered += 1;
            } else {
                let delay = with_jitter(backoff_delay(
                    self.config.backoff_base,
                    self.config.backoff_max,
                    failures,
                ));
                let retry_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(1));
                self.queue
                    .mark_failed(entry.entry_id, &err.message, Some(retry_at))?;
                report.retried += 1;
            }
        }
        tracing::warn!(
            source = %source,
            entries = entries.len(),
            error = %err.message,
            "transient delivery failure"
        );
        Ok(())
    }

    fn record_success(&self, source: &str, rows: usize, duration: Duration, correlation_id: &str) {
        if let Some(health) = &self.health {
            if let Err(e) = health.record_success(source, rows as u64, duration, correlation_id) {
                tracing::warn!("Failed to update health file: {:#}", e);
            }
        }
    }

    fn record_failure(&self, source: &str, error: &str, correlation_id: &str) {
        if let Some(health) = &self.health {
            if let Err(e) = health.record_failure(source, error, correlation_id) {
                tracing::warn!("Failed to update health file: {:#}", e);
            }
        }
    }
}
