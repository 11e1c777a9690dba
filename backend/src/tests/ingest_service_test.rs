// Ingest pipeline tests: body shapes, dedup, multiline reassembly, source
// matching and host resolution

use std::sync::Arc;

use crate::services::{AppConfigService, IngestService};
use crate::tests::common::{create_host_source, create_test_db, create_test_system};

fn ingest_service(pool: sqlx::SqlitePool, max_batch: usize) -> IngestService {
    let config_service = Arc::new(AppConfigService::new(pool.clone()));
    IngestService::new(pool, config_service, chrono_tz::UTC, max_batch)
}

#[tokio::test]
async fn test_ingest_keeps_events_from_other_hosts_separate() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({
        "events": [
            {"message": "[5-1] alpha", "host": "db1", "program": "postgres",
             "timestamp": "2024-06-01T10:00:00Z"},
            {"message": "[5-1] beta", "host": "db2", "program": "postgres",
             "timestamp": "2024-06-01T10:00:00Z"},
            {"message": "[5-2] gamma", "host": "db1", "program": "postgres",
             "timestamp": "2024-06-01T10:00:00Z"}
        ]
    });
    let response = service.ingest(body, None).await.expect("ingest failed");
    assert_eq!(response.accepted, 2);

    let messages: Vec<String> =
        sqlx::query_scalar("SELECT message FROM events ORDER BY message")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert!(messages.contains(&"alpha\ngamma".to_string()));
    // A lone continuation group on another host is untouched.
    assert!(messages.contains(&"[5-1] beta".to_string()));
}

#[tokio::test]
async fn test_ingest_accepts_and_stores_events() {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "web").await;
    create_host_source(&pool, system_id, "web-01").await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({
        "events": [
            {"message": "request served", "host": "web-01", "timestamp": "2024-06-01T10:00:00Z"},
            {"message": "request failed", "host": "web-01", "timestamp": "2024-06-01T10:00:01Z"}
        ]
    });

    let response = service.ingest(body, None).await.expect("ingest failed");
    assert_eq!(response.accepted, 2);
    assert_eq!(response.rejected, 0);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let matched: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE system_id = ?")
            .bind(system_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(matched, 2);
}

#[tokio::test]
async fn test_ingest_same_batch_twice_is_idempotent() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!([
        {"message": "checkpoint complete", "host": "db-01", "timestamp": "2024-06-01T10:00:00Z"},
        {"message": "autovacuum done", "host": "db-01", "timestamp": "2024-06-01T10:00:05Z"}
    ]);

    service.ingest(body.clone(), None).await.expect("first ingest");
    service.ingest(body, None).await.expect("second ingest");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2, "duplicate batch must not create new rows");
}

#[tokio::test]
async fn test_ingest_single_object_shape() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let response = service
        .ingest(serde_json::json!({"msg": "standalone entry"}), None)
        .await
        .expect("ingest failed");
    assert_eq!(response.accepted, 1);
}

#[tokio::test]
async fn test_ingest_rejects_entries_without_message() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({"events": [{"host": "web-01"}, {"message": "ok"}]});
    let response = service.ingest(body, None).await.expect("ingest failed");
    assert_eq!(response.accepted, 1);
    assert_eq!(response.rejected, 1);
    assert!(response.errors.is_some());
}

#[tokio::test]
async fn test_ingest_batch_cap() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 2);

    let body = serde_json::json!([
        {"message": "a"}, {"message": "b"}, {"message": "c"}
    ]);
    let result = service.ingest(body, None).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_docker_nat_host_resolution_end_to_end() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({
        "message": "hello",
        "source_ip": "172.17.0.1",
        "host": "10.20.30.40"
    });
    service.ingest(body, None).await.expect("ingest failed");

    let (host, source_ip): (Option<String>, Option<String>) =
        sqlx::query_as("SELECT host, source_ip FROM events LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(host.as_deref(), Some("10.20.30.40"));
    assert_eq!(source_ip.as_deref(), Some("10.20.30.40"));
}

#[tokio::test]
async fn test_multiline_continuation_merge_end_to_end() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({
        "events": [
            {"message": "[5-1] first", "host": "db", "program": "postgres",
             "timestamp": "2024-06-01T10:00:00Z"},
            {"message": "[5-2] #011second", "host": "db", "program": "postgres",
             "timestamp": "2024-06-01T10:00:00Z"},
            {"message": "[5-3] third", "host": "db", "program": "postgres",
             "timestamp": "2024-06-01T10:00:00Z"}
        ]
    });
    let response = service.ingest(body, None).await.expect("ingest failed");
    assert_eq!(response.accepted, 1);

    let message: String = sqlx::query_scalar("SELECT message FROM events LIMIT 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(message, "first\n\tsecond\nthird");
}

#[tokio::test]
async fn test_ingest_redacts_secrets_before_storage() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({
        "message": "login with password=hunter2 succeeded",
        "password": "hunter2"
    });
    service.ingest(body, None).await.expect("ingest failed");

    let (message, payload): (String, Option<String>) =
        sqlx::query_as("SELECT message, payload FROM events LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(!message.contains("hunter2"));
    assert!(message.contains("password=***"));
    let payload: serde_json::Value = serde_json::from_str(&payload.unwrap()).unwrap();
    assert_eq!(payload["password"], "***");
}

#[tokio::test]
async fn test_unmatched_events_reach_discovery_buffer() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({"message": "nobody knows me", "host": "mystery-host"});
    service.ingest(body, None).await.expect("ingest failed");

    // The discovery insert is fire-and-forget; poll briefly.
    let mut found = 0i64;
    for _ in 0..50 {
        found = sqlx::query_scalar("SELECT COUNT(*) FROM discovery_buffer")
            .fetch_one(&pool)
            .await
            .unwrap();
        if found > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(found, 1);

    let host: Option<String> =
        sqlx::query_scalar("SELECT host FROM discovery_buffer LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(host.as_deref(), Some("mystery-host"));
}

#[tokio::test]
async fn test_ingest_normalizes_severity_and_hash_invariant() {
    let pool = create_test_db().await;
    let service = ingest_service(pool.clone(), 1000);

    let body = serde_json::json!({
        "message": "disk warning",
        "severity": "WARN",
        "timestamp": "2024-06-01T10:00:00Z"
    });
    service.ingest(body, None).await.expect("ingest failed");

    let (severity, hash): (Option<String>, String) =
        sqlx::query_as("SELECT severity, normalized_hash FROM events LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(severity.as_deref(), Some("warning"));
    assert_eq!(hash.len(), 64);
}
