// Meta-analyzer tests: idempotency, synthetic results, the finding
// lifecycle and its guardrails, effective score blending

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::models::Finding;
use crate::services::llm::{
    CriterionScores, LlmError, MetaAnalyzeResponse, MetaFindingCandidate, ResolvedEntry,
};
use crate::services::{
    AppConfigService, MetaAnalyzer, MetaRunOptions, TemplateService,
};
use crate::tests::common::{
    ScriptedLlm, create_test_db, create_test_system, insert_event, insert_finding,
    insert_scores, insert_window, set_config, test_ai_config,
};

struct Harness {
    pool: sqlx::SqlitePool,
    analyzer: MetaAnalyzer,
    llm: Arc<ScriptedLlm>,
    system_id: i64,
}

async fn harness() -> Harness {
    let pool = create_test_db().await;
    let system_id = create_test_system(&pool, "prod").await;
    let config_service = Arc::new(AppConfigService::new(pool.clone()));
    let template_service = Arc::new(TemplateService::new(pool.clone()));
    let llm = Arc::new(ScriptedLlm::new());
    let analyzer = MetaAnalyzer::new(
        pool.clone(),
        config_service,
        template_service,
        Arc::clone(&llm) as Arc<dyn crate::services::llm::LlmService>,
    );
    Harness { pool, analyzer, llm, system_id }
}

/// One window with one scored event, ready for analysis.
async fn seed_scored_window(h: &Harness, score: f64) -> i64 {
    let from = Utc::now() - Duration::minutes(30);
    let to = from + Duration::minutes(5);
    let event_id = insert_event(
        &h.pool,
        Some(h.system_id),
        from + Duration::minutes(1),
        "connection refused by upstream database",
        Some("error"),
        Some("tmpl-1"),
    )
    .await;
    insert_scores(&h.pool, &event_id, score).await;
    insert_window(&h.pool, h.system_id, from, to).await
}

async fn load_finding(pool: &sqlx::SqlitePool, id: i64) -> Finding {
    sqlx::query_as("SELECT * FROM findings WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("finding exists")
}

#[tokio::test]
async fn test_analyzing_same_window_twice_yields_one_result() {
    let h = harness().await;
    let window_id = seed_scored_window(&h, 0.6).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        summary: "first run".into(),
        ..Default::default()
    });

    let first = h
        .analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();
    let second = h
        .analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();
    assert!(first);
    assert!(second);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meta_results WHERE window_id = ?")
        .bind(window_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
    // The second call must not have consumed another LLM response.
    assert_eq!(h.llm.meta_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_window_writes_synthetic_zero_result() {
    let h = harness().await;
    let from = Utc::now() - Duration::minutes(30);
    let window_id = insert_window(&h.pool, h.system_id, from, from + Duration::minutes(5)).await;

    let analyzed = h
        .analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();
    assert!(analyzed);

    let summary: Option<String> =
        sqlx::query_scalar("SELECT summary FROM meta_results WHERE window_id = ?")
            .bind(window_id)
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert!(summary.unwrap().contains("No significant events"));

    let effective: Vec<(f64,)> =
        sqlx::query_as("SELECT effective_value FROM effective_scores WHERE window_id = ?")
            .bind(window_id)
            .fetch_all(&h.pool)
            .await
            .unwrap();
    assert_eq!(effective.len(), 6);
    assert!(effective.iter().all(|(v,)| *v == 0.0));

    // No LLM tokens were spent.
    assert!(h.llm.meta_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_all_zero_window_skips_llm_and_increments_misses() {
    let h = harness().await;
    let finding_id =
        insert_finding(&h.pool, h.system_id, "Lingering disk pressure on /var", "medium", "open")
            .await;
    let window_id = seed_scored_window(&h, 0.0).await;

    let analyzed = h
        .analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();
    assert!(analyzed);

    assert!(h.llm.meta_calls.lock().unwrap().is_empty());
    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.consecutive_misses, 1);
    assert_eq!(finding.status, "open");
}

#[tokio::test]
async fn test_fingerprint_dedup_bumps_occurrence_and_escalates() {
    let h = harness().await;
    let finding_id = insert_finding(
        &h.pool,
        h.system_id,
        "Disk /dev/sda1 at 95% (host web-01)",
        "medium",
        "open",
    )
    .await;
    let window_id = seed_scored_window(&h, 0.7).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        meta_scores: CriterionScores { operational_risk: 0.4, ..Default::default() },
        summary: "disk pressure continues".into(),
        new_findings: vec![MetaFindingCandidate {
            text: "Disk /dev/sda1 at 96% (host web-01)".into(),
            severity: "high".into(),
            criterion: None,
        }],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM findings WHERE system_id = ?")
        .bind(h.system_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(count, 1, "duplicate finding must not create a new row");

    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.occurrence_count, 2);
    assert_eq!(finding.consecutive_misses, 0);
    // medium -> high is an upgrade
    assert_eq!(finding.severity, "high");
}

#[tokio::test]
async fn test_severity_never_downgrades_on_dedup() {
    let h = harness().await;
    let finding_id = insert_finding(
        &h.pool,
        h.system_id,
        "Disk /dev/sda1 at 95% (host web-01)",
        "critical",
        "open",
    )
    .await;
    let window_id = seed_scored_window(&h, 0.7).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        new_findings: vec![MetaFindingCandidate {
            text: "Disk /dev/sda1 at 97% (host web-01)".into(),
            severity: "low".into(),
            criterion: None,
        }],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.severity, "critical");
}

#[tokio::test]
async fn test_contradiction_guard_keeps_finding_open() {
    let h = harness().await;
    let finding_id = insert_finding(
        &h.pool,
        h.system_id,
        "Upstream database rejects connections",
        "high",
        "open",
    )
    .await;
    sqlx::query("UPDATE findings SET consecutive_misses = 3 WHERE id = ?")
        .bind(finding_id)
        .execute(&h.pool)
        .await
        .unwrap();

    let window_id = seed_scored_window(&h, 0.5).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        resolved_indices: vec![ResolvedEntry::Detailed {
            index: 0,
            evidence: "Error persists, connection still refused".into(),
            event_refs: vec![1],
        }],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.status, "open", "contradictory evidence must not resolve");
    assert_eq!(finding.consecutive_misses, 0, "the rejection counts as a sighting");
    assert!(finding.resolved_at.is_none());
}

#[tokio::test]
async fn test_legacy_bare_resolution_index_is_rejected() {
    let h = harness().await;
    let finding_id =
        insert_finding(&h.pool, h.system_id, "Queue depth keeps growing", "high", "open").await;
    let window_id = seed_scored_window(&h, 0.5).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        resolved_indices: vec![ResolvedEntry::Bare(0)],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.status, "open");
}

#[tokio::test]
async fn test_valid_resolution_records_event_evidence() {
    let h = harness().await;
    let finding_id = insert_finding(
        &h.pool,
        h.system_id,
        "Backup job has been failing nightly",
        "high",
        "open",
    )
    .await;

    let from = Utc::now() - Duration::minutes(30);
    let to = from + Duration::minutes(5);
    let event_id = insert_event(
        &h.pool,
        Some(h.system_id),
        from + Duration::minutes(1),
        "snapshot completed successfully, 120 GB written to vault",
        Some("info"),
        None,
    )
    .await;
    insert_scores(&h.pool, &event_id, 0.3).await;
    let window_id = insert_window(&h.pool, h.system_id, from, to).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        resolved_indices: vec![ResolvedEntry::Detailed {
            index: 0,
            evidence: "Snapshot completed and written to the vault".into(),
            event_refs: vec![1],
        }],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.status, "resolved");
    assert!(finding.resolved_at.is_some());
    assert_eq!(finding.resolved_by_meta_id, Some(1));

    let evidence: serde_json::Value =
        serde_json::from_str(&finding.resolution_evidence.unwrap()).unwrap();
    assert_eq!(evidence["event_ids"][0], event_id);
}

#[tokio::test]
async fn test_recurring_issue_creates_new_prefixed_finding() {
    let h = harness().await;
    let resolved_at = Utc::now() - Duration::days(5);
    let old_id = insert_finding(
        &h.pool,
        h.system_id,
        "Disk /dev/sda1 at 95% (host web-01)",
        "high",
        "resolved",
    )
    .await;
    sqlx::query("UPDATE findings SET resolved_at = ? WHERE id = ?")
        .bind(resolved_at)
        .bind(old_id)
        .execute(&h.pool)
        .await
        .unwrap();

    let window_id = seed_scored_window(&h, 0.6).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        new_findings: vec![MetaFindingCandidate {
            text: "Disk /dev/sda1 at 95% (host web-01)".into(),
            severity: "high".into(),
            criterion: None,
        }],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    // Previous finding untouched.
    let old = load_finding(&h.pool, old_id).await;
    assert_eq!(old.status, "resolved");

    let texts: Vec<String> =
        sqlx::query_scalar("SELECT text FROM findings WHERE system_id = ? AND status = 'open'")
            .bind(h.system_id)
            .fetch_all(&h.pool)
            .await
            .unwrap();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("Recurring: "));
    assert!(texts[0].contains("previously resolved"));
}

#[tokio::test]
async fn test_still_active_confirmation_resets_misses() {
    let h = harness().await;
    let finding_id =
        insert_finding(&h.pool, h.system_id, "Load balancer dropping requests", "high", "open")
            .await;
    sqlx::query("UPDATE findings SET consecutive_misses = 4 WHERE id = ?")
        .bind(finding_id)
        .execute(&h.pool)
        .await
        .unwrap();

    let window_id = seed_scored_window(&h, 0.5).await;
    h.llm.push_meta(MetaAnalyzeResponse {
        still_active_indices: vec![0],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.consecutive_misses, 0);
}

#[tokio::test]
async fn test_unclassified_findings_accumulate_misses() {
    let h = harness().await;
    let confirmed_id =
        insert_finding(&h.pool, h.system_id, "Load balancer dropping requests", "high", "open")
            .await;
    let ignored_id =
        insert_finding(&h.pool, h.system_id, "Stale cache entries on edge nodes", "low", "open")
            .await;

    let window_id = seed_scored_window(&h, 0.5).await;
    // The LLM classifies one finding and stays silent on the other. Context
    // ordering is newest-first, so index 0 is the ignored (newer) finding.
    h.llm.push_meta(MetaAnalyzeResponse {
        still_active_indices: vec![1],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let confirmed = load_finding(&h.pool, confirmed_id).await;
    let ignored = load_finding(&h.pool, ignored_id).await;
    assert_eq!(confirmed.consecutive_misses, 0);
    assert_eq!(ignored.consecutive_misses, 1);
}

#[tokio::test]
async fn test_empty_classification_safeguard_skips_misses() {
    let h = harness().await;
    let finding_id =
        insert_finding(&h.pool, h.system_id, "Load balancer dropping requests", "high", "open")
            .await;

    let window_id = seed_scored_window(&h, 0.5).await;
    // Open findings in context, yet the LLM returned no classifications at
    // all: the dormancy counter must not move.
    h.llm.push_meta(MetaAnalyzeResponse::default());

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let finding = load_finding(&h.pool, finding_id).await;
    assert_eq!(finding.consecutive_misses, 0);
}

#[tokio::test]
async fn test_llm_failure_writes_zero_scores_without_meta_result() {
    let h = harness().await;
    let window_id = seed_scored_window(&h, 0.8).await;
    h.llm.push_meta_error(LlmError::Timeout(120));

    let analyzed = h
        .analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();
    assert!(!analyzed);

    let meta_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM meta_results WHERE window_id = ?")
            .bind(window_id)
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(meta_count, 0, "failed analysis must not leave a meta result");

    let effective_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM effective_scores WHERE window_id = ?")
            .bind(window_id)
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(effective_count, 6, "zero effective scores are still written");
}

#[tokio::test]
async fn test_effective_score_blend_and_zero_voiding() {
    let h = harness().await;
    let from = Utc::now() - Duration::minutes(30);
    let to = from + Duration::minutes(5);
    let event_id = insert_event(
        &h.pool,
        Some(h.system_id),
        from + Duration::minutes(1),
        "strange handshake pattern from peer",
        Some("warning"),
        None,
    )
    .await;
    // Only the anomaly criterion (id 4) carries a non-zero event score.
    for criterion_id in 1..=6 {
        let score = if criterion_id == 4 { 0.8 } else { 0.0 };
        sqlx::query(
            "INSERT INTO event_scores (event_id, criterion_id, score_type, score) \
             VALUES (?, ?, 'event', ?)",
        )
        .bind(&event_id)
        .bind(criterion_id)
        .bind(score)
        .execute(&h.pool)
        .await
        .unwrap();
    }
    let window_id = insert_window(&h.pool, h.system_id, from, to).await;

    h.llm.push_meta(MetaAnalyzeResponse {
        meta_scores: CriterionScores { anomaly: 0.5, it_security: 0.9, ..Default::default() },
        summary: "anomalous handshakes".into(),
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let rows: Vec<(i64, f64, f64, f64)> = sqlx::query_as(
        "SELECT criterion_id, effective_value, meta_score, max_event_score \
         FROM effective_scores WHERE window_id = ? ORDER BY criterion_id",
    )
    .bind(window_id)
    .fetch_all(&h.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 6);

    for (criterion_id, effective, meta, max_event) in rows {
        if criterion_id == 4 {
            // 0.7 * 0.5 + 0.3 * 0.8
            assert!((effective - 0.59).abs() < 1e-9);
            assert_eq!(meta, 0.5);
            assert_eq!(max_event, 0.8);
        } else {
            // No event backing: the meta conclusion is void, including the
            // 0.9 it_security claim.
            assert_eq!(effective, 0.0);
            assert_eq!(meta, 0.0);
            assert_eq!(max_event, 0.0);
        }
    }
}

#[tokio::test]
async fn test_open_findings_cap_evicts_lowest_priority() {
    let h = harness().await;
    set_config(
        &h.pool,
        "meta_analysis_config",
        serde_json::json!({"max_open_findings_per_system": 2}),
    )
    .await;

    let low_id =
        insert_finding(&h.pool, h.system_id, "Noisy cron mail backlog", "info", "open").await;
    insert_finding(&h.pool, h.system_id, "Replica lag climbing steadily", "high", "open").await;
    insert_finding(&h.pool, h.system_id, "Certificate expires in 5 days", "critical", "open")
        .await;

    let window_id = seed_scored_window(&h, 0.5).await;
    h.llm.push_meta(MetaAnalyzeResponse {
        still_active_indices: vec![0, 1, 2],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let open: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM findings WHERE system_id = ? AND status = 'open'",
    )
    .bind(h.system_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(open, 2);

    let evicted = load_finding(&h.pool, low_id).await;
    assert_eq!(evicted.status, "resolved");
    let evidence = evicted.resolution_evidence.unwrap();
    assert!(evidence.contains("Auto-closed"));
}

#[tokio::test]
async fn test_max_new_findings_cap_keeps_highest_severity() {
    let h = harness().await;
    set_config(
        &h.pool,
        "meta_analysis_config",
        serde_json::json!({"max_new_findings_per_window": 1}),
    )
    .await;

    let window_id = seed_scored_window(&h, 0.5).await;
    h.llm.push_meta(MetaAnalyzeResponse {
        new_findings: vec![
            MetaFindingCandidate {
                text: "Minor cron noise on standby".into(),
                severity: "low".into(),
                criterion: None,
            },
            MetaFindingCandidate {
                text: "Primary database close to connection limit".into(),
                severity: "critical".into(),
                criterion: None,
            },
        ],
        ..Default::default()
    });

    h.analyzer
        .analyze_window(window_id, &test_ai_config(), &MetaRunOptions::default())
        .await
        .unwrap();

    let findings: Vec<(String, String)> =
        sqlx::query_as("SELECT text, severity FROM findings WHERE system_id = ?")
            .bind(h.system_id)
            .fetch_all(&h.pool)
            .await
            .unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].1, "critical");
}
