// Normal-behavior template tests: CRUD, preview, retroactive zeroing and
// the effective-score fallout

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::models::{CreateTemplateRequest, PreviewTemplateRequest};
use crate::services::{AppConfigService, RecalcService, TemplateService};
use crate::tests::common::{
    create_test_db, create_test_system, insert_event, insert_scores, insert_window,
};

async fn harness() -> (sqlx::SqlitePool, Arc<TemplateService>, RecalcService, i64) {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let config_service = Arc::new(AppConfigService::new(pool.clone()));
    let template_service = Arc::new(TemplateService::new(pool.clone()));
    let recalc = RecalcService::new(
        pool.clone(),
        config_service,
        Arc::clone(&template_service),
    );
    (pool, template_service, recalc, system_id)
}

fn create_request(system_id: i64, example: &str) -> CreateTemplateRequest {
    CreateTemplateRequest {
        system_id: Some(system_id),
        pattern: None,
        example_message: Some(example.to_string()),
        host: None,
        program: None,
        notes: None,
        enabled: true,
    }
}

#[tokio::test]
async fn test_create_generates_anchored_pattern() {
    let (_pool, templates, _recalc, system_id) = harness().await;

    let template = templates
        .create(create_request(system_id, "docker0: port 3(veth0) entering forwarding state"))
        .await
        .unwrap();

    assert!(template.pattern.starts_with('^'));
    assert!(template.pattern.ends_with('$'));
    assert!(!template.pattern.contains(".*"));
    assert!(template.enabled);

    let compiled = templates.compiled_templates().await.unwrap();
    assert_eq!(compiled.len(), 1);
    assert!(compiled[0].matches(
        Some(system_id),
        "docker0: port 7(veth9) entering forwarding state",
        None,
        None
    ));
}

#[tokio::test]
async fn test_create_rejects_invalid_explicit_pattern() {
    let (_pool, templates, _recalc, system_id) = harness().await;

    let request = CreateTemplateRequest {
        system_id: Some(system_id),
        pattern: Some("^[unclosed$".to_string()),
        example_message: None,
        host: None,
        program: None,
        notes: None,
        enabled: true,
    };
    assert!(templates.create(request).await.is_err());
}

#[tokio::test]
async fn test_crud_invalidates_compiled_cache() {
    let (_pool, templates, _recalc, system_id) = harness().await;

    let template = templates
        .create(create_request(system_id, "link up on port 3"))
        .await
        .unwrap();
    assert_eq!(templates.compiled_templates().await.unwrap().len(), 1);

    templates.delete(template.id).await.unwrap();
    assert_eq!(templates.compiled_templates().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_preview_counts_matching_events() {
    let (pool, templates, _recalc, system_id) = harness().await;

    let ts = Utc::now() - Duration::hours(1);
    insert_event(&pool, Some(system_id), ts, "session 1234 closed", Some("info"), None).await;
    insert_event(&pool, Some(system_id), ts, "session 9876 closed", Some("info"), None).await;
    insert_event(&pool, Some(system_id), ts, "something unrelated", Some("info"), None).await;

    let preview = templates
        .preview(
            PreviewTemplateRequest {
                example_message: "session 5555 closed".to_string(),
                system_id: Some(system_id),
                host: None,
                program: None,
            },
            7,
        )
        .await
        .unwrap();

    assert_eq!(preview.matching_events, 2);
    assert_eq!(preview.sample_matches.len(), 2);
}

#[tokio::test]
async fn test_retroactive_zeroing_and_effective_score_fallout() {
    let (pool, templates, recalc, system_id) = harness().await;

    let from = Utc::now() - Duration::hours(2);
    let to = from + Duration::minutes(5);
    let routine = insert_event(&pool, Some(system_id), from + Duration::minutes(1),
        "docker0: port 3(veth0) entering forwarding state", Some("info"), None).await;
    insert_scores(&pool, &routine, 0.7).await;
    let window_id = insert_window(&pool, system_id, from, to).await;
    for criterion_id in 1..=6 {
        sqlx::query(
            "INSERT INTO effective_scores \
             (window_id, system_id, criterion_id, effective_value, meta_score, max_event_score) \
             VALUES (?, ?, ?, 0.56, 0.5, 0.7)",
        )
        .bind(window_id)
        .bind(system_id)
        .bind(criterion_id)
        .execute(&pool)
        .await
        .unwrap();
    }

    let template = templates
        .create(create_request(system_id, "docker0: port 3(veth0) entering forwarding state"))
        .await
        .unwrap();

    let zeroed = templates.zero_matching_scores(&template, 7).await.unwrap();
    assert_eq!(zeroed.len(), 1);

    let scores: Vec<(f64,)> =
        sqlx::query_as("SELECT score FROM event_scores WHERE event_id = ?")
            .bind(&routine)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(scores.len(), 6);
    assert!(scores.iter().all(|(s,)| *s == 0.0));

    // Scores are already zeroed, so the rebuild may skip template matching.
    recalc.recalculate(Some(system_id), true).await.unwrap();

    let rows: Vec<(f64, f64)> = sqlx::query_as(
        "SELECT effective_value, max_event_score FROM effective_scores WHERE window_id = ?",
    )
    .bind(window_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 6);
    for (effective, max_event) in rows {
        assert_eq!(max_event, 0.0);
        assert_eq!(effective, 0.0, "windows emptied by the template read zero");
    }
}

#[tokio::test]
async fn test_global_template_applies_to_every_system() {
    let (pool, templates, _recalc, system_id) = harness().await;
    let other_system = create_test_system(&pool, "staging").await;

    templates
        .create(CreateTemplateRequest {
            system_id: None,
            pattern: None,
            example_message: Some("ntp drift corrected by 12 ms".to_string()),
            host: None,
            program: None,
            notes: None,
            enabled: true,
        })
        .await
        .unwrap();

    let compiled = templates.compiled_templates().await.unwrap();
    assert!(compiled[0].matches(Some(system_id), "ntp drift corrected by 99 ms", None, None));
    assert!(compiled[0].matches(Some(other_system), "ntp drift corrected by 1 ms", None, None));
}
