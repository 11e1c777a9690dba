// Windowing tests: fully-scored intervals become windows, unscored
// intervals block, manual windows for re-evaluation

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use crate::models::Window;
use crate::services::{AppConfigService, WindowService};
use crate::tests::common::{
    create_test_db, create_test_system, insert_event, insert_scores,
};

/// A timestamp safely inside one 5-minute interval, `minutes_ago` in the
/// past, so a test batch never straddles an interval boundary.
fn aligned_ts(minutes_ago: i64) -> DateTime<Utc> {
    let raw = Utc::now() - Duration::minutes(minutes_ago);
    let floored = (raw.timestamp() / 300) * 300;
    Utc.timestamp_opt(floored + 60, 0).single().expect("valid timestamp")
}

async fn harness() -> (sqlx::SqlitePool, WindowService, i64) {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let config_service = Arc::new(AppConfigService::new(pool.clone()));
    let service = WindowService::new(pool.clone(), config_service);
    (pool, service, system_id)
}

#[tokio::test]
async fn test_fully_scored_interval_becomes_window() {
    let (pool, service, system_id) = harness().await;

    let ts = aligned_ts(30);
    let a = insert_event(&pool, Some(system_id), ts, "event one", Some("info"), None).await;
    let b = insert_event(&pool, Some(system_id), ts + Duration::seconds(30), "event two",
        Some("info"), None).await;
    insert_scores(&pool, &a, 0.1).await;
    insert_scores(&pool, &b, 0.2).await;

    let created = service.run().await.unwrap();
    assert_eq!(created.len(), 1);
    let window = &created[0];
    assert_eq!(window.system_id, system_id);
    assert_eq!(window.trigger_kind, "scheduled");
    assert!(window.from_ts <= ts && ts < window.to_ts);
    assert_eq!((window.to_ts - window.from_ts).num_minutes(), 5);
}

#[tokio::test]
async fn test_unscored_events_block_windowing() {
    let (pool, service, system_id) = harness().await;

    let ts = aligned_ts(30);
    let a = insert_event(&pool, Some(system_id), ts, "scored", Some("info"), None).await;
    insert_event(&pool, Some(system_id), ts + Duration::seconds(10), "unscored",
        Some("info"), None).await;
    insert_scores(&pool, &a, 0.1).await;

    let created = service.run().await.unwrap();
    assert!(created.is_empty(), "an interval with unscored events must wait");
}

#[tokio::test]
async fn test_recent_events_wait_for_the_guard() {
    let (pool, service, system_id) = harness().await;

    // Inside the guard interval: too fresh to close.
    let ts = Utc::now() - Duration::minutes(2);
    let a = insert_event(&pool, Some(system_id), ts, "fresh event", Some("info"), None).await;
    insert_scores(&pool, &a, 0.1).await;

    let created = service.run().await.unwrap();
    assert!(created.is_empty());
}

#[tokio::test]
async fn test_windowing_resumes_after_last_window() {
    let (pool, service, system_id) = harness().await;

    let ts = aligned_ts(60);
    let a = insert_event(&pool, Some(system_id), ts, "old event", Some("info"), None).await;
    insert_scores(&pool, &a, 0.1).await;

    let first_pass = service.run().await.unwrap();
    assert_eq!(first_pass.len(), 1);

    // Nothing new: no additional windows.
    let second_pass = service.run().await.unwrap();
    assert!(second_pass.is_empty());

    // A later event produces exactly one more window.
    let later = aligned_ts(20);
    let b = insert_event(&pool, Some(system_id), later, "new event", Some("info"), None).await;
    insert_scores(&pool, &b, 0.3).await;

    let third_pass = service.run().await.unwrap();
    assert_eq!(third_pass.len(), 1);
    assert!(third_pass[0].from_ts >= first_pass[0].to_ts);
}

#[tokio::test]
async fn test_manual_window_spans_requested_days() {
    let (pool, service, system_id) = harness().await;

    let window = service.create_manual_window(system_id, Some(3)).await.unwrap();
    assert_eq!(window.trigger_kind, "manual");
    let span_days = (window.to_ts - window.from_ts).num_days();
    assert_eq!(span_days, 3);

    let stored: Window = sqlx::query_as("SELECT * FROM windows WHERE id = ?")
        .bind(window.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored.trigger_kind, "manual");
}

#[tokio::test]
async fn test_manual_window_unknown_system() {
    let (_pool, service, _system_id) = harness().await;
    let result = service.create_manual_window(9999, None).await;
    assert!(result.is_err());
}
