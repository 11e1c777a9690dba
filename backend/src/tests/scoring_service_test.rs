// Scoring job tests: template grouping, propagation, degradation on LLM
// failure, template-matching shortcut

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::services::llm::{CriterionScores, LlmError};
use crate::services::{AppConfigService, ScoringService, TemplateService};
use crate::tests::common::{
    ScriptedLlm, create_test_db, create_test_system, insert_event, test_ai_config,
};

struct Harness {
    pool: sqlx::SqlitePool,
    scoring: ScoringService,
    llm: Arc<ScriptedLlm>,
    system_id: i64,
}

async fn harness() -> Harness {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let config_service = Arc::new(AppConfigService::new(pool.clone()));
    let template_service = Arc::new(TemplateService::new(pool.clone()));
    let llm = Arc::new(ScriptedLlm::new());
    let scoring = ScoringService::new(
        pool.clone(),
        config_service,
        template_service,
        Arc::clone(&llm) as Arc<dyn crate::services::llm::LlmService>,
    );
    Harness { pool, scoring, llm, system_id }
}

async fn score_rows(pool: &sqlx::SqlitePool, event_id: &str) -> Vec<(i64, f64)> {
    sqlx::query_as(
        "SELECT criterion_id, score FROM event_scores WHERE event_id = ? ORDER BY criterion_id",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_template_grouping_sends_one_representative() {
    let h = harness().await;
    let ts = Utc::now() - Duration::minutes(10);
    let a = insert_event(&h.pool, Some(h.system_id), ts, "conn refused from 10.0.0.1",
        Some("error"), Some("tmpl-x")).await;
    let b = insert_event(&h.pool, Some(h.system_id), ts + Duration::seconds(1),
        "conn refused from 10.0.0.2", Some("error"), Some("tmpl-x")).await;
    let c = insert_event(&h.pool, Some(h.system_id), ts + Duration::seconds(2),
        "disk almost full", Some("warning"), Some("tmpl-y")).await;

    h.llm.push_scores(vec![
        CriterionScores { failure_prediction: 0.7, ..Default::default() },
        CriterionScores { operational_risk: 0.4, ..Default::default() },
    ]);

    let scored = h.scoring.run(&test_ai_config()).await.unwrap();
    assert_eq!(scored, 3);

    // Only two representatives went out.
    let calls = h.llm.score_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 2);
    drop(calls);

    // Every event carries all six criteria.
    for id in [&a, &b, &c] {
        assert_eq!(score_rows(&h.pool, id).await.len(), 6);
    }

    // Group members share the representative's scores.
    let rows_a = score_rows(&h.pool, &a).await;
    let rows_b = score_rows(&h.pool, &b).await;
    assert_eq!(rows_a, rows_b);

    // llm_usage was recorded.
    let usage: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_usage WHERE task = 'scoring'")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(usage, 1);
}

#[tokio::test]
async fn test_llm_failure_emits_zero_scores() {
    let h = harness().await;
    let ts = Utc::now() - Duration::minutes(10);
    let id = insert_event(&h.pool, Some(h.system_id), ts, "some event", Some("info"), None).await;

    h.llm.push_score_error(LlmError::Timeout(120));

    let scored = h.scoring.run(&test_ai_config()).await.unwrap();
    assert_eq!(scored, 1);

    let rows = score_rows(&h.pool, &id).await;
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|(_, score)| *score == 0.0));

    // The event is not re-queued: a second run finds nothing unscored.
    let scored_again = h.scoring.run(&test_ai_config()).await.unwrap();
    assert_eq!(scored_again, 0);
}

#[tokio::test]
async fn test_template_matching_events_score_zero_without_llm() {
    let h = harness().await;
    sqlx::query(
        "INSERT INTO normal_behavior_templates (system_id, pattern, enabled) VALUES (?, ?, 1)",
    )
    .bind(h.system_id)
    .bind("^heartbeat from node \\d+$")
    .execute(&h.pool)
    .await
    .unwrap();

    let ts = Utc::now() - Duration::minutes(10);
    let id = insert_event(&h.pool, Some(h.system_id), ts, "heartbeat from node 7",
        Some("info"), None).await;

    let scored = h.scoring.run(&test_ai_config()).await.unwrap();
    assert_eq!(scored, 1);

    let rows = score_rows(&h.pool, &id).await;
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|(_, score)| *score == 0.0));

    assert!(h.llm.score_calls.lock().unwrap().is_empty(), "no LLM call for routine events");
}

#[tokio::test]
async fn test_unmatched_events_are_not_scored() {
    let h = harness().await;
    let ts = Utc::now() - Duration::minutes(10);
    insert_event(&h.pool, None, ts, "orphan event", Some("info"), None).await;

    let scored = h.scoring.run(&test_ai_config()).await.unwrap();
    assert_eq!(scored, 0);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_scores")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}
