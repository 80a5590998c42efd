// ABOUTME: Integration tests for the PostgreSQL destination
// ABOUTME: Requires TEST_TARGET_URL; run with `cargo test -- --ignored`

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::env;
use tosh_capture::{ChangeRecord, QueueEntry};
use tosh_sync::destination::{Destination, PostgresDestination, WriteErrorKind};
use tosh_sync::postgres::{connect, ConnectionSettings};

fn get_test_url() -> Option<String> {
    env::var("TEST_TARGET_URL").ok()
}

fn test_table_name(suffix: &str) -> String {
    format!("tosh_test_{}", suffix)
}

fn entry(entry_id: i64, source: &str, record_id: i64, payload: Value) -> QueueEntry {
    let payload: Map<String, Value> = match payload {
        Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    };
    QueueEntry {
        entry_id,
        record: ChangeRecord::new(source, record_id, payload),
        attempts: 0,
        last_error: None,
        enqueued_at: Utc::now(),
        next_attempt_at: None,
        dead_lettered_at: None,
    }
}

async fn drop_table(url: &str, table: &str) {
    let client = connect(&ConnectionSettings::new(url))
        .await
        .expect("Failed to connect to target");
    let _ = client
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#, table))
        .await;
}

/// Test: repeated writes of the same records leave one row per record
#[tokio::test]
#[ignore]
async fn test_upsert_is_idempotent() {
    let url = get_test_url().expect("TEST_TARGET_URL must be set");
    let table = test_table_name("idempotent");
    drop_table(&url, &table).await;

    let destination = PostgresDestination::new(ConnectionSettings::new(&url), "public", &table);
    destination.prepare().await.expect("Failed to create table");

    let batch = vec![
        entry(1, "chat", 10, json!({"id": 10, "text": "hi"})),
        entry(2, "chat", 11, json!({"id": 11, "text": "there"})),
    ];
    destination.write_batch("chat", &batch).await.unwrap();
    destination.write_batch("chat", &batch).await.unwrap();

    let updated = vec![entry(3, "chat", 11, json!({"id": 11, "text": "edited"}))];
    destination.write_batch("chat", &updated).await.unwrap();

    let client = connect(&ConnectionSettings::new(&url)).await.unwrap();
    let rows = client
        .query(
            &format!(
                r#"SELECT source_record_id, payload FROM "public"."{}" ORDER BY source_record_id"#,
                table
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    let payload: Value = rows[1].get(1);
    assert_eq!(payload["text"], "edited");

    println!("✓ Upsert wrote {} rows after three batches", rows.len());
    drop_table(&url, &table).await;
}

/// Test: a NUL byte inside a JSON string is rejected as a permanent error
#[tokio::test]
#[ignore]
async fn test_invalid_payload_is_permanent() {
    let url = get_test_url().expect("TEST_TARGET_URL must be set");
    let table = test_table_name("permanent");
    drop_table(&url, &table).await;

    let destination = PostgresDestination::new(ConnectionSettings::new(&url), "public", &table);
    destination.prepare().await.unwrap();

    let batch = vec![entry(1, "chat", 1, json!({"text": "bad \u{0000} byte"}))];
    let err = destination.write_batch("chat", &batch).await.unwrap_err();
    assert_eq!(err.kind, WriteErrorKind::Permanent, "{}", err);

    drop_table(&url, &table).await;
}

/// Test: an unreachable server is a transient error
#[tokio::test]
#[ignore]
async fn test_unreachable_destination_is_transient() {
    let destination = PostgresDestination::new(
        ConnectionSettings::new("postgresql://tosh@127.0.0.1:1/comms"),
        "public",
        "tosh_changes",
    );
    let batch = vec![entry(1, "chat", 1, json!({"text": "hi"}))];
    let err = destination.write_batch("chat", &batch).await.unwrap_err();
    assert_eq!(err.kind, WriteErrorKind::Transient);
}
