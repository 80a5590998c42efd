// ABOUTME: Per-source watch loop - turns file changes and timer ticks into detection passes
// ABOUTME: IDLE -> DETECTING -> ENQUEUEING -> IDLE, with BACKOFF on source errors

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tosh_capture::wal::{start_wal_watcher, WalEvent, WalWatcherConfig, WalWatcherHandle};
use tosh_capture::{ChangeQueue, CursorStore, DetectError, DetectOutcome, SourceDetector, Watermark};

use crate::config::WatchSettings;
use crate::delivery::backoff_delay;

/// Why a detection pass was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTrigger {
    FileChanged(WalEvent),
    Timer,
}

impl From<WalEvent> for WatchTrigger {
    fn from(event: WalEvent) -> Self {
        WatchTrigger::FileChanged(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Detecting,
    Enqueueing,
    Backoff,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Window in which further triggers collapse into one pass
    pub debounce: Duration,
    /// Timer trigger period, for missed or unavailable notifications
    pub fallback_interval: Duration,
    pub file_poll_interval: Duration,
    /// Maximum records per pass; a full pass is followed immediately by another
    pub batch_limit: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig::from(&WatchSettings::default())
    }
}

impl From<&WatchSettings> for WatchConfig {
    fn from(settings: &WatchSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.debounce_ms),
            fallback_interval: Duration::from_secs(settings.fallback_interval_secs.max(1)),
            file_poll_interval: Duration::from_millis(settings.file_poll_interval_ms),
            batch_limit: settings.batch_limit,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

/// Result of one detection pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// `detected` records were read; `enqueued` of them were new to the queue
    /// or newer versions of queued ones.
    Enqueued {
        detected: usize,
        enqueued: usize,
        candidate: Watermark,
    },
    NoChanges,
    RetryLater(DetectError),
}

/// Schedules detection for one source and feeds the shared queue.
///
/// The loop never writes the cursor; it only reads it. Detection resumes
/// after whichever is higher: the delivered cursor or the newest watermark
/// already queued for this source.
pub struct SourceWatchLoop {
    detector: Arc<dyn SourceDetector>,
    queue: ChangeQueue,
    cursors: CursorStore,
    config: WatchConfig,
    state: WatchState,
    consecutive_failures: u32,
}

impl SourceWatchLoop {
    pub fn new(detector: Arc<dyn SourceDetector>, queue: ChangeQueue, config: WatchConfig) -> Self {
        let cursors = queue.cursor_store();
        Self {
            detector,
            queue,
            cursors,
            config,
            state: WatchState::Idle,
            consecutive_failures: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.detector.name()
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    fn transition(&mut self, next: WatchState) {
        if self.state != next {
            tracing::debug!(source = %self.detector.name(), from = ?self.state, to = ?next, "watch state");
            self.state = next;
        }
    }

    /// Watermark detection starts after.
    pub fn detection_start(&self) -> Result<Watermark> {
        let name = self.detector.name();
        // Queue first: an acknowledgement landing between the two reads
        // removes entries and raises the cursor, so the second read still
        // covers them.
        let queued = self.queue.max_watermark(name)?;
        let cursor = self.cursors.high_water_mark(name)?;
        Ok(queued.map_or(cursor, |queued| cursor.max(queued)))
    }

    /// Run one detection pass and enqueue its records atomically.
    pub async fn run_pass(&mut self) -> Result<PassOutcome> {
        self.transition(WatchState::Detecting);
        let after = self.detection_start()?;
        let detector = Arc::clone(&self.detector);
        let limit = self.config.batch_limit;
        let outcome = tokio::task::spawn_blocking(move || detector.detect(after, limit))
            .await
            .context("detection task failed")?;

        match outcome {
            DetectOutcome::Changes { records, candidate } => {
                self.transition(WatchState::Enqueueing);
                let inserted = self.queue.enqueue_batch(&records)?;
                tracing::info!(
                    source = %self.detector.name(),
                    %after,
                    %candidate,
                    detected = records.len(),
                    enqueued = inserted.len(),
                    "changes enqueued"
                );
                self.consecutive_failures = 0;
                self.transition(WatchState::Idle);
                Ok(PassOutcome::Enqueued {
                    detected: records.len(),
                    enqueued: inserted.len(),
                    candidate,
                })
            }
            DetectOutcome::NoChanges => {
                self.consecutive_failures = 0;
                self.transition(WatchState::Idle);
                Ok(PassOutcome::NoChanges)
            }
            DetectOutcome::RetryLater(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.transition(WatchState::Backoff);
                tracing::warn!(
                    source = %self.detector.name(),
                    failures = self.consecutive_failures,
                    error = %err,
                    "detection deferred"
                );
                Ok(PassOutcome::RetryLater(err))
            }
        }
    }

    /// Run passes until the source has no more full batches.
    pub async fn catch_up(&mut self) -> Result<PassOutcome> {
        let mut detected_total = 0;
        let mut enqueued_total = 0;
        let mut last_candidate = None;
        loop {
            match self.run_pass().await? {
                PassOutcome::Enqueued {
                    detected,
                    enqueued,
                    candidate,
                } => {
                    detected_total += detected;
                    enqueued_total += enqueued;
                    last_candidate = Some(candidate);
                    if detected < self.config.batch_limit {
                        break;
                    }
                }
                PassOutcome::NoChanges => break,
                PassOutcome::RetryLater(err) => {
                    self.transition(WatchState::Idle);
                    return Ok(PassOutcome::RetryLater(err));
                }
            }
        }
        Ok(match last_candidate {
            Some(candidate) => PassOutcome::Enqueued {
                detected: detected_total,
                enqueued: enqueued_total,
                candidate,
            },
            None => PassOutcome::NoChanges,
        })
    }

    fn current_backoff(&self) -> Duration {
        backoff_delay(
            self.config.backoff_base,
            self.config.backoff_max,
            self.consecutive_failures.max(1),
        )
    }

    fn start_file_watcher(
        &self,
        sender: mpsc::UnboundedSender<WatchTrigger>,
    ) -> Option<WalWatcherHandle> {
        let path = self.detector.watch_path()?;
        let options = WalWatcherConfig {
            poll_interval: self.config.file_poll_interval,
            min_event_bytes: 0,
        };
        match start_wal_watcher(path, options, sender) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(
                    source = %self.detector.name(),
                    error = %format!("{e:#}"),
                    "file watcher unavailable, relying on timer"
                );
                None
            }
        }
    }

    /// Run until `shutdown` fires. Errors are queue storage failures.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchTrigger>();
        let watcher = self.start_file_watcher(tx.clone());

        let timer_tx = tx;
        let fallback = self.config.fallback_interval;
        let timer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(fallback);
            loop {
                interval.tick().await;
                if timer_tx.send(WatchTrigger::Timer).is_err() {
                    break;
                }
            }
        });

        tracing::info!(
            source = %self.detector.name(),
            file_watch = watcher.is_some(),
            fallback_secs = fallback.as_secs(),
            "watch loop started"
        );

        let result = self.event_loop(&mut rx, &mut shutdown).await;

        timer.abort();
        if let Some(watcher) = watcher {
            // Joining waits out the poller's sleep; keep it off the runtime.
            if let Err(e) = tokio::task::spawn_blocking(move || watcher.stop()).await {
                tracing::warn!(
                    source = %self.detector.name(),
                    error = %e,
                    "file watcher did not stop cleanly"
                );
            }
        }
        tracing::info!(source = %self.detector.name(), "watch loop stopped");
        result
    }

    async fn event_loop(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<WatchTrigger>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        'triggers: loop {
            let trigger = tokio::select! {
                biased;
                _ = shutdown.recv() => break 'triggers,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break 'triggers,
                },
            };
            tracing::trace!(source = %self.detector.name(), ?trigger, "trigger received");

            // Collapse triggers arriving within the debounce window.
            let window = tokio::time::sleep(self.config.debounce);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break 'triggers,
                    _ = &mut window => break,
                    more = rx.recv() => if more.is_none() { break },
                }
            }

            loop {
                let outcome = tokio::select! {
                    biased;
                    _ = shutdown.recv() => break 'triggers,
                    outcome = self.run_pass() => outcome?,
                };
                match outcome {
                    PassOutcome::Enqueued { detected, .. } if detected >= self.config.batch_limit => {
                        continue
                    }
                    PassOutcome::Enqueued { .. } | PassOutcome::NoChanges => break,
                    PassOutcome::RetryLater(_) => {
                        let delay = self.current_backoff();
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => break 'triggers,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        self.transition(WatchState::Idle);
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::tempdir;
    use tosh_capture::ChangeRecord;

    /// Serves scripted outcomes and records the watermark of each call.
    struct ScriptedDetector {
        outcomes: Mutex<Vec<DetectOutcome>>,
        calls: Mutex<Vec<Watermark>>,
        passes: AtomicUsize,
        watch_path: Option<PathBuf>,
    }

    impl ScriptedDetector {
        fn new(mut outcomes: Vec<DetectOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
                passes: AtomicUsize::new(0),
                watch_path: None,
            }
        }

        fn watching(mut self, path: PathBuf) -> Self {
            self.watch_path = Some(path);
            self
        }

        fn calls(&self) -> Vec<Watermark> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SourceDetector for ScriptedDetector {
        fn name(&self) -> &str {
            "calls"
        }

        fn detect(&self, after: Watermark, _limit: usize) -> DetectOutcome {
            self.passes.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(after);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(DetectOutcome::NoChanges)
        }

        fn watch_path(&self) -> Option<&Path> {
            self.watch_path.as_deref()
        }
    }

    fn marks(values: &[i64]) -> Vec<Watermark> {
        values.iter().copied().map(Watermark::Integer).collect()
    }

    fn changes(ids: &[i64]) -> DetectOutcome {
        DetectOutcome::Changes {
            records: ids
                .iter()
                .map(|id| ChangeRecord::new("calls", *id, Default::default()))
                .collect(),
            candidate: Watermark::Integer(*ids.iter().max().unwrap()),
        }
    }

    async fn wait_for_passes(detector: &ScriptedDetector, passes: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while detector.passes.load(Ordering::SeqCst) < passes {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_pass_resumes_after_queued_records() {
        let dir = tempdir().unwrap();
        let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
        let detector = Arc::new(ScriptedDetector::new(vec![changes(&[1, 2, 3]), changes(&[4])]));
        let mut watch = SourceWatchLoop::new(detector.clone(), queue.clone(), WatchConfig::default());

        assert_eq!(
            watch.run_pass().await.unwrap(),
            PassOutcome::Enqueued {
                detected: 3,
                enqueued: 3,
                candidate: Watermark::Integer(3)
            }
        );
        watch.run_pass().await.unwrap();
        assert_eq!(detector.calls(), marks(&[0, 3]));
        // The cursor itself is untouched until delivery.
        assert_eq!(
            queue.cursor_store().high_water_mark("calls").unwrap(),
            Watermark::START
        );
        assert_eq!(watch.state(), WatchState::Idle);
    }

    #[tokio::test]
    async fn test_detection_start_covers_acknowledged_and_queued_records() {
        let dir = tempdir().unwrap();
        let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
        let detector = Arc::new(ScriptedDetector::new(vec![changes(&[1, 2, 3, 4])]));
        let mut watch = SourceWatchLoop::new(detector, queue.clone(), WatchConfig::default());
        watch.run_pass().await.unwrap();

        let queued = queue.peek_batch(10).unwrap();
        queue.acknowledge_and_advance("calls", &queued[..2]).unwrap();
        assert_eq!(watch.detection_start().unwrap(), Watermark::Integer(4));

        queue.acknowledge_and_advance("calls", &queued[2..]).unwrap();
        assert!(queue.peek_batch(10).unwrap().is_empty());
        assert_eq!(watch.detection_start().unwrap(), Watermark::Integer(4));
    }

    #[tokio::test]
    async fn test_retry_later_enters_backoff() {
        let dir = tempdir().unwrap();
        let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
        let detector = Arc::new(ScriptedDetector::new(vec![DetectOutcome::RetryLater(
            DetectError::Busy("database is locked".into()),
        )]));
        let mut watch = SourceWatchLoop::new(detector, queue.clone(), WatchConfig::default());

        let outcome = watch.run_pass().await.unwrap();
        assert!(matches!(outcome, PassOutcome::RetryLater(DetectError::Busy(_))));
        assert_eq!(watch.state(), WatchState::Backoff);
        assert!(queue.peek_batch(10).unwrap().is_empty());
        assert_eq!(watch.current_backoff(), WatchConfig::default().backoff_base);
    }

    #[tokio::test]
    async fn test_catch_up_drains_full_batches() {
        let dir = tempdir().unwrap();
        let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
        let detector = Arc::new(ScriptedDetector::new(vec![
            changes(&[1, 2]),
            changes(&[3, 4]),
            changes(&[5]),
        ]));
        let config = WatchConfig {
            batch_limit: 2,
            ..WatchConfig::default()
        };
        let mut watch = SourceWatchLoop::new(detector.clone(), queue.clone(), config);

        let outcome = watch.catch_up().await.unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Enqueued {
                detected: 5,
                enqueued: 5,
                candidate: Watermark::Integer(5)
            }
        );
        assert_eq!(detector.calls(), marks(&[0, 2, 4]));
        assert_eq!(queue.peek_batch(10).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_run_debounces_and_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
        let detector = Arc::new(ScriptedDetector::new(vec![changes(&[1])]));
        let config = WatchConfig {
            debounce: Duration::from_millis(20),
            fallback_interval: Duration::from_secs(3600),
            ..WatchConfig::default()
        };
        let watch = SourceWatchLoop::new(detector.clone(), queue.clone(), config);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(watch.run(shutdown_rx));

        // The first timer tick fires immediately and triggers one pass.
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.peek_batch(10).unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(detector.passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_file_changes_inside_debounce_window_collapse_into_one_pass() {
        let dir = tempdir().unwrap();
        let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
        let detector = Arc::new(ScriptedDetector::new(vec![changes(&[1, 2]), changes(&[3])]));
        let debounce = Duration::from_millis(150);
        let config = WatchConfig {
            debounce,
            ..WatchConfig::default()
        };
        let mut watch = SourceWatchLoop::new(detector.clone(), queue.clone(), config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { watch.event_loop(&mut rx, &mut shutdown_rx).await });

        let burst_started = Instant::now();
        for frame in 1..=5u64 {
            tx.send(WatchTrigger::FileChanged(WalEvent {
                db_path: dir.path().join("calls.db"),
                bytes_added: 4096,
                current_size: 4096 * frame,
            }))
            .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(burst_started.elapsed() < debounce, "burst must fit in the window");

        wait_for_passes(&detector, 1).await;
        tokio::time::sleep(debounce * 2).await;
        assert_eq!(detector.passes.load(Ordering::SeqCst), 1);
        assert_eq!(queue.peek_batch(10).unwrap().len(), 2);

        // A change after the window starts a new pass.
        tx.send(WatchTrigger::Timer).unwrap();
        wait_for_passes(&detector, 2).await;
        assert_eq!(detector.calls(), marks(&[0, 2]));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(detector.passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stopping_file_watcher_leaves_runtime_responsive() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("calls.db");
        std::fs::write(&source, b"").unwrap();
        let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
        let detector = Arc::new(ScriptedDetector::new(Vec::new()).watching(source));
        let config = WatchConfig {
            fallback_interval: Duration::from_secs(3600),
            file_poll_interval: Duration::from_millis(1500),
            ..WatchConfig::default()
        };
        let watch = SourceWatchLoop::new(detector.clone(), queue, config);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(watch.run(shutdown_rx));
        wait_for_passes(&detector, 1).await;

        // On this single-threaded runtime a blocking join would stall the
        // ticker for most of the poll interval.
        let longest_gap = Arc::new(Mutex::new(Duration::ZERO));
        let gap = Arc::clone(&longest_gap);
        let ticker = tokio::spawn(async move {
            loop {
                let before = Instant::now();
                tokio::time::sleep(Duration::from_millis(10)).await;
                let elapsed = before.elapsed();
                let mut longest = gap.lock().unwrap();
                *longest = (*longest).max(elapsed);
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        ticker.abort();

        let longest = *longest_gap.lock().unwrap();
        assert!(longest < Duration::from_millis(500), "runtime stalled for {longest:?}");
    }
}
