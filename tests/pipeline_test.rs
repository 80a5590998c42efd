mod common;

use common::{create_source, insert_events, test_config, FakeDestination};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast;
use tosh_capture::{
    ChangeQueue, ChangeRecord, DetectOutcome, QueueCorrupt, SourceDetector, Watermark,
};
use tosh_sync::delivery::{DeliveryConfig, DeliveryEngine};
use tosh_sync::destination::{Destination, WriteError};
use tosh_sync::health::{HealthFile, OverallHealth};
use tosh_sync::watch::{PassOutcome, SourceWatchLoop, WatchConfig};
use tosh_sync::Pipeline;

fn pipeline_with(config: tosh_sync::PipelineConfig, fake: &Arc<FakeDestination>) -> Pipeline {
    Pipeline::with_destination(config, fake.clone()).unwrap()
}

#[tokio::test]
async fn once_delivers_new_rows_and_advances_cursor() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, 1..=3);
    let fake = Arc::new(FakeDestination::new());
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.delivery.delivered, 3);
    assert_eq!(
        summary.detection,
        vec![(
            "chat".to_string(),
            PassOutcome::Enqueued {
                detected: 3,
                enqueued: 3,
                candidate: Watermark::Integer(3)
            }
        )]
    );
    assert_eq!(fake.record_ids("chat"), vec![1, 2, 3]);
    assert_eq!(fake.payload("chat", 2).unwrap()["body"], "event 2");

    let queue = pipeline.queue();
    assert_eq!(queue.cursor_store().high_water_mark("chat").unwrap(), Watermark::Integer(3));
    assert_eq!(queue.peek_batch(10).unwrap().len(), 0);

    insert_events(&source, 4..=5);
    let summary = pipeline.run_once(&[]).await.unwrap();
    assert_eq!(summary.delivery.delivered, 2);
    assert_eq!(fake.write_order("chat"), vec![1, 2, 3, 4, 5]);
    assert_eq!(queue.cursor_store().high_water_mark("chat").unwrap(), Watermark::Integer(5));
}

#[tokio::test]
async fn destination_outage_keeps_records_queued_until_recovery() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, 1..=3);
    let fake = Arc::new(FakeDestination::new());
    fake.set_unavailable(true);
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(summary.delivery.paused);
    assert!(!summary.is_clean());
    assert_eq!(summary.delivery.delivered, 0);
    assert_eq!(summary.delivery.retried, 3);
    assert_eq!(fake.row_count(), 0);

    let queue = pipeline.queue();
    assert_eq!(queue.cursor_store().high_water_mark("chat").unwrap(), Watermark::START);
    let pending = queue.peek_batch(10).unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|e| e.attempts == 1 && e.last_error.is_some()));

    fake.set_unavailable(false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(summary.is_clean());
    // Queued records are not detected a second time.
    assert_eq!(summary.detection[0].1, PassOutcome::NoChanges);
    assert_eq!(summary.delivery.delivered, 3);
    assert_eq!(fake.record_ids("chat"), vec![1, 2, 3]);
    assert_eq!(queue.cursor_store().high_water_mark("chat").unwrap(), Watermark::Integer(3));
}

#[tokio::test]
async fn rejected_record_is_dead_lettered_without_blocking_the_rest() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, 1..=4);
    let fake = Arc::new(FakeDestination::new());
    fake.reject("chat", 2);
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(!summary.is_clean());
    assert_eq!(summary.delivery.delivered, 3);
    assert_eq!(summary.delivery.dead_lettered, 1);
    assert_eq!(fake.record_ids("chat"), vec![1, 3, 4]);

    let queue = pipeline.queue();
    let dead = queue.list_dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].source_record_id(), 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("record 2"));
    assert_eq!(queue.cursor_store().high_water_mark("chat").unwrap(), Watermark::Integer(4));

    // Nothing new, and the dead letter stays parked.
    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.delivery.delivered, 0);
    assert_eq!(queue.list_dead_letters(10).unwrap().len(), 1);

    let health = HealthFile::load(&pipeline.config().status_path).unwrap();
    assert_eq!(health.overall(), OverallHealth::Ok);
    assert!(health.sources["chat"].last_error.is_some());
}

#[tokio::test]
async fn requeued_dead_letter_is_delivered_once_accepted() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, 1..=2);
    let fake = Arc::new(FakeDestination::new());
    fake.reject("chat", 1);
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    pipeline.run_once(&[]).await.unwrap();
    let dead = pipeline.queue().list_dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);

    // The operator fixes the destination and retries.
    drop(pipeline);
    let fake_fixed = Arc::new(FakeDestination::new());
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake_fixed);
    assert!(pipeline.queue().requeue_dead_letter(dead[0].entry_id).unwrap());
    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.delivery.delivered, 1);
    assert_eq!(fake_fixed.record_ids("chat"), vec![1]);
    assert!(pipeline.queue().list_dead_letters(10).unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_record() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, [1]);
    let fake = Arc::new(FakeDestination::new());
    fake.set_unavailable(true);
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    let engine = DeliveryEngine::new(
        pipeline.queue().clone(),
        fake.clone(),
        DeliveryConfig {
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        },
    );

    pipeline.run_once(&[]).await.unwrap();
    let mut dead_lettered = 0;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        dead_lettered += engine.run_once().await.unwrap().dead_lettered;
        if dead_lettered > 0 {
            break;
        }
    }
    assert_eq!(dead_lettered, 1);

    let dead = pipeline.queue().list_dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    // One failure from `once` (max_retries 3) plus two more here.
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].last_error.as_deref(), Some("connection refused"));
    assert_eq!(
        pipeline.queue().cursor_store().high_water_mark("chat").unwrap(),
        Watermark::START
    );
}

#[tokio::test]
async fn redelivery_after_unacknowledged_write_is_idempotent() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, 1..=3);
    let fake = Arc::new(FakeDestination::new());
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    // Simulate a crash between the destination commit and the queue ack.
    fake.set_unavailable(true);
    pipeline.run_once(&[]).await.unwrap();
    fake.set_unavailable(false);
    let queued = pipeline.queue().peek_batch(10).unwrap();
    fake.write_batch("chat", &queued).await.unwrap();
    assert_eq!(fake.row_count(), 3);
    drop(pipeline);

    // The restarted process finds the unacknowledged entries in queue.db.
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);
    assert_eq!(pipeline.queue().peek_batch(10).unwrap().len(), 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = pipeline.run_once(&[]).await.unwrap();
    assert_eq!(summary.detection[0].1, PassOutcome::NoChanges);
    assert_eq!(summary.delivery.delivered, 3);
    assert_eq!(fake.row_count(), 3);
    assert_eq!(fake.write_order("chat"), vec![1, 2, 3, 1, 2, 3]);
    assert!(pipeline.queue().peek_batch(10).unwrap().is_empty());
}

#[tokio::test]
async fn small_batches_preserve_per_source_order() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, 1..=10);
    let fake = Arc::new(FakeDestination::new());
    let mut config = test_config(dir.path(), &[("chat", &source)]);
    config.delivery.batch_size = 3;
    let pipeline = pipeline_with(config, &fake);

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert_eq!(summary.delivery.delivered, 10);
    assert_eq!(fake.write_order("chat"), (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn backing_off_source_does_not_hold_back_others() {
    let dir = tempdir().unwrap();
    let alpha = create_source(dir.path(), "alpha");
    let beta = create_source(dir.path(), "beta");
    insert_events(&alpha, 1..=2);
    insert_events(&beta, 1..=3);
    let fake = Arc::new(FakeDestination::new());
    fake.fail_next("alpha", WriteError::transient("deadlock detected"));
    let pipeline = pipeline_with(
        test_config(dir.path(), &[("alpha", &alpha), ("beta", &beta)]),
        &fake,
    );

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(summary.delivery.paused);
    assert_eq!(summary.delivery.retried, 2);
    assert_eq!(fake.row_count(), 0);

    let engine = DeliveryEngine::new(
        pipeline.queue().clone(),
        fake.clone(),
        DeliveryConfig::default(),
    );
    // alpha's entries are due within milliseconds; push them out explicitly.
    let retry_at = chrono::Utc::now() + chrono::Duration::seconds(60);
    for entry in pipeline.queue().peek_batch(10).unwrap() {
        if entry.source_name() == "alpha" {
            pipeline
                .queue()
                .mark_failed(entry.entry_id, "deadlock detected", Some(retry_at))
                .unwrap();
        }
    }

    let report = engine.run_once().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(report.deferred, 2);
    assert_eq!(fake.record_ids("beta"), vec![1, 2, 3]);
    assert!(fake.record_ids("alpha").is_empty());
}

#[tokio::test]
async fn record_succeeds_on_third_attempt_after_two_transient_failures() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, [1]);
    let fake = Arc::new(FakeDestination::new());
    fake.fail_next("chat", WriteError::transient("connection reset by peer"));
    fake.fail_next("chat", WriteError::transient("connection timed out"));
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert_eq!(summary.delivery.retried, 1);

    let engine = DeliveryEngine::new(
        pipeline.queue().clone(),
        fake.clone(),
        DeliveryConfig::from(&pipeline.config().delivery),
    );
    let mut attempts_before_success = 0;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        if let Some(entry) = pipeline.queue().peek_batch(1).unwrap().first() {
            attempts_before_success = entry.attempts;
        }
        if engine.run_once().await.unwrap().delivered == 1 {
            break;
        }
    }

    assert_eq!(attempts_before_success, 2);
    assert_eq!(fake.write_order("chat"), vec![1]);
    assert!(pipeline.queue().peek_batch(10).unwrap().is_empty());
    assert!(pipeline.queue().list_dead_letters(10).unwrap().is_empty());
    assert_eq!(
        pipeline.queue().cursor_store().high_water_mark("chat").unwrap(),
        Watermark::Integer(1)
    );
}

#[tokio::test]
async fn malformed_record_does_not_block_other_sources() {
    let dir = tempdir().unwrap();
    let alpha = create_source(dir.path(), "alpha");
    let beta = create_source(dir.path(), "beta");
    insert_events(&alpha, [1]);
    insert_events(&beta, 1..=2);
    let fake = Arc::new(FakeDestination::new());
    fake.reject("alpha", 1);
    let pipeline = pipeline_with(
        test_config(dir.path(), &[("alpha", &alpha), ("beta", &beta)]),
        &fake,
    );

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert_eq!(summary.delivery.dead_lettered, 1);
    assert_eq!(summary.delivery.delivered, 2);
    assert_eq!(summary.delivery.retried, 0);
    assert_eq!(fake.record_ids("beta"), vec![1, 2]);

    let dead = pipeline.queue().list_dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].source_name(), "alpha");
    // Dead-lettered after its first and only attempt.
    assert_eq!(dead[0].attempts, 1);
}

#[tokio::test]
async fn unknown_source_filter_is_rejected() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    let fake = Arc::new(FakeDestination::new());
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    let err = pipeline
        .run_once(&["calls".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unknown source 'calls'"));
}

#[tokio::test]
async fn missing_source_file_is_skipped() {
    let dir = tempdir().unwrap();
    let present = create_source(dir.path(), "chat");
    insert_events(&present, [1]);
    let missing = dir.path().join("gone.db");
    let fake = Arc::new(FakeDestination::new());
    let pipeline = pipeline_with(
        test_config(dir.path(), &[("chat", &present), ("gone", &missing)]),
        &fake,
    );

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(matches!(summary.detection[1].1, PassOutcome::RetryLater(_)));
    assert_eq!(summary.delivery.delivered, 1);
    assert!(!missing.exists());
}

#[tokio::test]
async fn continuous_run_picks_up_new_rows_and_stops_on_shutdown() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    insert_events(&source, 1..=2);
    let fake = Arc::new(FakeDestination::new());
    let pipeline = pipeline_with(test_config(dir.path(), &[("chat", &source)]), &fake);

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let handle = tokio::spawn(pipeline.run(shutdown_tx.clone()));

    wait_for(|| fake.row_count() == 2).await;
    insert_events(&source, 3..=4);
    wait_for(|| fake.row_count() == 4).await;

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(fake.write_order("chat"), vec![1, 2, 3, 4]);

    let health = HealthFile::load(&dir.path().join("health.json")).unwrap();
    assert_eq!(health.overall(), OverallHealth::Ok);
}

#[tokio::test]
async fn corrupt_queue_entry_stops_running_pipeline() {
    let dir = tempdir().unwrap();
    let source = create_source(dir.path(), "chat");
    let fake = Arc::new(FakeDestination::new());
    let config = test_config(dir.path(), &[("chat", &source)]);
    let queue_path = config.queue_path.clone();
    let pipeline = pipeline_with(config, &fake);
    pipeline
        .queue()
        .enqueue(&ChangeRecord::new("chat", 7, Default::default()))
        .unwrap();
    rusqlite::Connection::open(&queue_path)
        .unwrap()
        .execute("UPDATE queue_entries SET payload = '{'", [])
        .unwrap();

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let err = tokio::time::timeout(Duration::from_secs(10), pipeline.run(shutdown_tx))
        .await
        .expect("pipeline kept running on a corrupt queue")
        .unwrap_err();
    assert!(
        err.downcast_ref::<QueueCorrupt>().is_some(),
        "expected QueueCorrupt, got: {err:#}"
    );
    assert_eq!(fake.row_count(), 0);
}

fn create_cards(dir: &Path) -> (std::path::PathBuf, rusqlite::Connection) {
    let path = dir.join("cards.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE cards (id INTEGER PRIMARY KEY, name TEXT NOT NULL, modified REAL NOT NULL);
         INSERT INTO cards VALUES (1, 'Ann', 100.5);
         INSERT INTO cards VALUES (2, 'Bo', 101.0);",
    )
    .unwrap();
    (path, conn)
}

fn cards_config(dir: &Path, path: &Path) -> tosh_sync::PipelineConfig {
    let mut config = test_config(dir, &[("cards", path)]);
    config.sources[0].table = Some("cards".into());
    config.sources[0].watermark_column = Some("modified".into());
    config
}

#[tokio::test]
async fn edited_row_is_delivered_again_with_new_version() {
    let dir = tempdir().unwrap();
    let (path, conn) = create_cards(dir.path());
    let fake = Arc::new(FakeDestination::new());
    let pipeline = pipeline_with(cards_config(dir.path(), &path), &fake);

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert_eq!(summary.delivery.delivered, 2);
    let cursors = pipeline.queue().cursor_store();
    assert_eq!(cursors.high_water_mark("cards").unwrap(), Watermark::Real(101.0));

    conn.execute("UPDATE cards SET name = 'Anne', modified = 150.25 WHERE id = 1", [])
        .unwrap();
    let summary = pipeline.run_once(&[]).await.unwrap();
    assert_eq!(
        summary.detection[0].1,
        PassOutcome::Enqueued {
            detected: 1,
            enqueued: 1,
            candidate: Watermark::Real(150.25)
        }
    );
    assert_eq!(fake.payload("cards", 1).unwrap()["name"], "Anne");
    assert_eq!(fake.row_count(), 2);
    assert_eq!(fake.write_order("cards"), vec![1, 2, 1]);
    assert_eq!(cursors.high_water_mark("cards").unwrap(), Watermark::Real(150.25));
}

#[tokio::test]
async fn edit_while_queued_is_delivered_once_with_latest_version() {
    let dir = tempdir().unwrap();
    let (path, conn) = create_cards(dir.path());
    let fake = Arc::new(FakeDestination::new());
    fake.set_unavailable(true);
    let pipeline = pipeline_with(cards_config(dir.path(), &path), &fake);

    pipeline.run_once(&[]).await.unwrap();
    assert_eq!(pipeline.queue().peek_batch(10).unwrap().len(), 2);

    conn.execute("UPDATE cards SET name = 'Anne', modified = 150.25 WHERE id = 1", [])
        .unwrap();
    fake.set_unavailable(false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = pipeline.run_once(&[]).await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.delivery.delivered, 2);
    assert_eq!(fake.payload("cards", 1).unwrap()["name"], "Anne");
    assert_eq!(fake.write_order("cards"), vec![1, 2]);
    assert_eq!(
        pipeline.queue().cursor_store().high_water_mark("cards").unwrap(),
        Watermark::Real(150.25)
    );
}

/// Append-only source that releases a few more rows on every pass.
struct GrowingSource {
    total: i64,
    step: i64,
    released: AtomicI64,
}

impl GrowingSource {
    fn new(total: i64, step: i64) -> Self {
        Self {
            total,
            step,
            released: AtomicI64::new(0),
        }
    }

    fn exhausted(&self) -> bool {
        self.released.load(Ordering::SeqCst) >= self.total
    }
}

impl SourceDetector for GrowingSource {
    fn name(&self) -> &str {
        "chat"
    }

    fn detect(&self, after: Watermark, limit: usize) -> DetectOutcome {
        let released = (self.released.fetch_add(self.step, Ordering::SeqCst) + self.step)
            .min(self.total);
        let after = match after {
            Watermark::Integer(id) => id,
            Watermark::Real(mark) => mark as i64,
        };
        let last = released.min(after + limit as i64);
        if last <= after {
            return DetectOutcome::NoChanges;
        }
        DetectOutcome::Changes {
            records: (after + 1..=last)
                .map(|id| ChangeRecord::new("chat", id, Default::default()))
                .collect(),
            candidate: Watermark::Integer(last),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_delivery_never_causes_redetection() {
    let dir = tempdir().unwrap();
    let queue = ChangeQueue::open(dir.path().join("queue.db")).unwrap();
    let fake = Arc::new(FakeDestination::new());
    let detector = Arc::new(GrowingSource::new(3_000, 7));

    let engine = DeliveryEngine::new(
        queue.clone(),
        fake.clone(),
        DeliveryConfig {
            batch_size: 5,
            ..DeliveryConfig::default()
        },
    );
    let detecting = Arc::new(AtomicBool::new(true));
    let delivering = {
        let detecting = Arc::clone(&detecting);
        tokio::spawn(async move {
            while detecting.load(Ordering::SeqCst) {
                engine.run_once().await.unwrap();
                tokio::task::yield_now().await;
            }
            engine.drain().await.unwrap();
        })
    };

    let config = WatchConfig {
        batch_limit: 50,
        ..WatchConfig::default()
    };
    let mut watch = SourceWatchLoop::new(detector.clone(), queue.clone(), config);
    loop {
        let outcome = watch.run_pass().await.unwrap();
        if outcome == PassOutcome::NoChanges && detector.exhausted() {
            break;
        }
    }
    detecting.store(false, Ordering::SeqCst);
    delivering.await.unwrap();

    let writes = fake.write_order("chat");
    assert_eq!(fake.row_count(), 3_000);
    assert_eq!(
        writes.len(),
        3_000,
        "delivered records were detected and written again"
    );
    assert_eq!(
        queue.cursor_store().high_water_mark("chat").unwrap(),
        Watermark::Integer(3_000)
    );
}

async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 10s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
