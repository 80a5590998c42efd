// ABOUTME: Wires watch loops, the durable queue and the delivery engine together
// ABOUTME: Owns startup (secret, queue, destination) and cooperative shutdown

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tosh_capture::{ChangeQueue, DetectError, SourceDetector, SqliteDetector};

use crate::config::PipelineConfig;
use crate::delivery::{backoff_delay, DeliveryConfig, DeliveryEngine, DeliveryReport};
use crate::destination::{Destination, PostgresDestination};
use crate::health::HealthRecorder;
use crate::postgres::{connect, ConnectionSettings};
use crate::secrets::provider_from_config;
use crate::watch::{PassOutcome, SourceWatchLoop, WatchConfig};

/// Result of `tosh-sync once`.
#[derive(Debug, Clone)]
pub struct OnceSummary {
    pub detection: Vec<(String, PassOutcome)>,
    pub delivery: DeliveryReport,
}

impl OnceSummary {
    /// True when every detected record was delivered or is still queued for
    /// a retry that the destination did not refuse outright.
    pub fn is_clean(&self) -> bool {
        self.delivery.dead_lettered == 0 && !self.delivery.paused
    }
}

/// A configured pipeline ready to run.
pub struct Pipeline {
    config: PipelineConfig,
    queue: ChangeQueue,
    destination: Arc<dyn Destination>,
    health: Arc<HealthRecorder>,
}

/// Fetch the destination password from the configured backend.
pub async fn fetch_password(config: &PipelineConfig) -> Result<Option<String>> {
    match provider_from_config(&config.destination.secret) {
        Some(provider) => {
            tracing::info!("Fetching destination password from {}", provider.describe());
            let password = provider
                .fetch()
                .await
                .with_context(|| format!("Failed to fetch password from {}", provider.describe()))?;
            Ok(Some(password))
        }
        None => Ok(None),
    }
}

impl Pipeline {
    /// Fetch the secret, open the queue and build the PostgreSQL destination.
    /// Any failure here is a startup error.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let password = fetch_password(&config).await?;
        let settings = ConnectionSettings::from_config(&config.destination, password);
        tracing::info!("Destination: {}", settings.display_url());
        let destination = Arc::new(PostgresDestination::from_config(&config, settings));
        Self::with_destination(config, destination)
    }

    pub fn with_destination(config: PipelineConfig, destination: Arc<dyn Destination>) -> Result<Self> {
        let queue = ChangeQueue::open(&config.queue_path).with_context(|| {
            format!("Failed to open change queue {}", config.queue_path.display())
        })?;
        let health = Arc::new(HealthRecorder::open(&config.status_path));
        Ok(Self {
            config,
            queue,
            destination,
            health,
        })
    }

    pub fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn detectors(&self, only: &[String]) -> Result<Vec<Arc<dyn SourceDetector>>> {
        for name in only {
            if self.config.source(name).is_none() {
                bail!("Unknown source '{}'", name);
            }
        }
        self.config
            .sources
            .iter()
            .filter(|source| only.is_empty() || only.contains(&source.name))
            .map(|source| {
                let detector = source.build_detector(&self.config.watch)?;
                Ok(Arc::new(detector) as Arc<dyn SourceDetector>)
            })
            .collect()
    }

    fn delivery_engine(&self) -> DeliveryEngine {
        DeliveryEngine::new(
            self.queue.clone(),
            Arc::clone(&self.destination),
            DeliveryConfig::from(&self.config.delivery),
        )
        .with_health(Arc::clone(&self.health))
    }

    /// One catch-up pass per selected source, then drain the queue.
    pub async fn run_once(&self, only: &[String]) -> Result<OnceSummary> {
        let detectors = self.detectors(only)?;
        self.destination
            .prepare()
            .await
            .context("Failed to prepare destination")?;

        let mut detection = Vec::with_capacity(detectors.len());
        for detector in detectors {
            let name = detector.name().to_string();
            let mut watch =
                SourceWatchLoop::new(detector, self.queue.clone(), WatchConfig::from(&self.config.watch));
            let outcome = watch.catch_up().await?;
            detection.push((name, outcome));
        }

        let delivery = self.delivery_engine().drain().await?;
        Ok(OnceSummary {
            detection,
            delivery,
        })
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run_until_signal(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Received shutdown signal");
            let _ = signal_tx.send(());
        });
        self.run(shutdown_tx).await
    }

    /// Run every watch loop plus the delivery engine until `shutdown` fires
    /// or one of them fails. Remaining tasks get `shutdown_grace_secs` to
    /// finish before they are aborted.
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let mut shutdown_rx = shutdown.subscribe();
        let detectors = self.detectors(&[])?;
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for detector in detectors {
            let name = detector.name().to_string();
            let watch =
                SourceWatchLoop::new(detector, self.queue.clone(), WatchConfig::from(&self.config.watch));
            let rx = shutdown.subscribe();
            tasks.spawn(async move {
                watch
                    .run(rx)
                    .await
                    .with_context(|| format!("Watch loop for source '{}' failed", name))
            });
        }

        let engine = self.delivery_engine();
        let destination = Arc::clone(&self.destination);
        let delivery_config = DeliveryConfig::from(&self.config.delivery);
        let mut rx = shutdown.subscribe();
        tasks.spawn(async move {
            if !prepare_destination(destination.as_ref(), &delivery_config, &mut rx).await {
                return Ok(());
            }
            engine.run(rx).await.context("Delivery engine failed")
        });

        tracing::info!(
            "Pipeline running with {} source(s), queue {}",
            self.config.sources.len(),
            self.queue.path().display()
        );

        let mut first_error = None;
        tokio::select! {
            _ = shutdown_rx.recv() => {}
            Some(joined) = tasks.join_next() => {
                first_error = task_error(joined);
                if first_error.is_none() {
                    tracing::warn!("A pipeline task exited early; shutting down");
                }
            }
        }

        let _ = shutdown.send(());
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Some(e) = task_error(joined) {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        tracing::error!("{:#}", e);
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "Shutdown grace period of {:?} elapsed; aborting remaining tasks",
                grace
            );
            tasks.abort_all();
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Pipeline stopped");
                Ok(())
            }
        }
    }
}

fn task_error(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(anyhow::anyhow!("Pipeline task panicked: {}", e)),
    }
}

/// Retry destination setup until it succeeds. Returns false on shutdown.
/// Watch loops keep filling the queue meanwhile.
async fn prepare_destination(
    destination: &dyn Destination,
    config: &DeliveryConfig,
    shutdown: &mut broadcast::Receiver<()>,
) -> bool {
    let mut attempt = 0u32;
    loop {
        match destination.prepare().await {
            Ok(()) => return true,
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = backoff_delay(config.backoff_base, config.backoff_max, attempt);
                tracing::warn!(
                    "Destination not ready (attempt {}): {:#}; retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Outcome of `tosh-sync check` for one source.
#[derive(Debug)]
pub struct SourceCheck {
    pub name: String,
    pub path: String,
    pub result: std::result::Result<(), DetectError>,
}

/// Open every source read-only and compile its query.
pub fn check_sources(config: &PipelineConfig) -> Result<Vec<SourceCheck>> {
    config
        .sources
        .iter()
        .map(|source| {
            let detector: SqliteDetector = source.build_detector(&config.watch)?;
            Ok(SourceCheck {
                name: source.name.clone(),
                path: detector.path().display().to_string(),
                result: detector.verify(),
            })
        })
        .collect()
}

/// Fetch the secret and open one destination connection.
pub async fn check_destination(config: &PipelineConfig) -> Result<Duration> {
    let password = fetch_password(config).await?;
    let settings = ConnectionSettings::from_config(&config.destination, password);
    let started = std::time::Instant::now();
    let client = connect(&settings).await?;
    client
        .simple_query("SELECT 1")
        .await
        .with_context(|| format!("Query against {} failed", settings.display_url()))?;
    Ok(started.elapsed())
}
