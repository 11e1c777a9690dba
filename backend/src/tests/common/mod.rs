// Common test utilities and helpers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::models::TaskModelConfig;
use crate::services::finding_dedup::fingerprint;
use crate::services::llm::{
    AiConfig, ContextFinding, CriterionScores, LlmError, LlmService, LlmUsage,
    MetaAnalyzeResponse, MetaContext, MetaEventLine, MetaOptions, ScoreEventLine, ScoreOptions,
};

/// Create an in-memory SQLite database with the full schema
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub async fn create_test_system(pool: &SqlitePool, name: &str) -> i64 {
    let result = sqlx::query(
        "INSERT INTO monitored_systems (name, description) VALUES (?, 'test system')",
    )
    .bind(name)
    .execute(pool)
    .await
    .expect("Failed to insert system");
    result.last_insert_rowid()
}

pub async fn create_host_source(pool: &SqlitePool, system_id: i64, host: &str) -> i64 {
    let result = sqlx::query(
        "INSERT INTO log_sources (system_id, label, host_hint) VALUES (?, ?, ?)",
    )
    .bind(system_id)
    .bind(format!("{}-source", host))
    .bind(host)
    .execute(pool)
    .await
    .expect("Failed to insert log source");
    result.last_insert_rowid()
}

/// Insert one event directly (bypassing the ingest pipeline)
pub async fn insert_event(
    pool: &SqlitePool,
    system_id: Option<i64>,
    timestamp: DateTime<Utc>,
    message: &str,
    severity: Option<&str>,
    template_id: Option<&str>,
) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO events (id, timestamp, received_at, system_id, message, severity, host, \
         normalized_hash, template_id) VALUES (?, ?, ?, ?, ?, ?, 'test-host', ?, ?)",
    )
    .bind(&id)
    .bind(timestamp)
    .bind(timestamp)
    .bind(system_id)
    .bind(message)
    .bind(severity)
    .bind(Uuid::new_v4().to_string())
    .bind(template_id)
    .execute(pool)
    .await
    .expect("Failed to insert event");
    id
}

/// Insert score rows for all six criteria with the same value
pub async fn insert_scores(pool: &SqlitePool, event_id: &str, score: f64) {
    for criterion_id in 1..=6 {
        sqlx::query(
            "INSERT INTO event_scores (event_id, criterion_id, score_type, score) \
             VALUES (?, ?, 'event', ?)",
        )
        .bind(event_id)
        .bind(criterion_id)
        .bind(score)
        .execute(pool)
        .await
        .expect("Failed to insert score");
    }
}

pub async fn insert_window(
    pool: &SqlitePool,
    system_id: i64,
    from_ts: DateTime<Utc>,
    to_ts: DateTime<Utc>,
) -> i64 {
    let result = sqlx::query(
        "INSERT INTO windows (system_id, from_ts, to_ts, trigger_kind) \
         VALUES (?, ?, ?, 'scheduled')",
    )
    .bind(system_id)
    .bind(from_ts)
    .bind(to_ts)
    .execute(pool)
    .await
    .expect("Failed to insert window");
    result.last_insert_rowid()
}

pub async fn insert_finding(
    pool: &SqlitePool,
    system_id: i64,
    text: &str,
    severity: &str,
    status: &str,
) -> i64 {
    let result = sqlx::query(
        "INSERT INTO findings (system_id, text, severity, status, fingerprint) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(system_id)
    .bind(text)
    .bind(severity)
    .bind(status)
    .bind(fingerprint(text))
    .execute(pool)
    .await
    .expect("Failed to insert finding");
    result.last_insert_rowid()
}

pub async fn set_config(pool: &SqlitePool, key: &str, value: serde_json::Value) {
    sqlx::query(
        "INSERT INTO app_config (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(pool)
    .await
    .expect("Failed to set config");
}

pub fn test_ai_config() -> AiConfig {
    AiConfig {
        api_key: "test-key".to_string(),
        model: "test-model".to_string(),
        base_url: "http://localhost:1".to_string(),
        task_models: TaskModelConfig::default(),
    }
}

/// Captured arguments of one meta call
pub struct MetaCall {
    pub lines: Vec<MetaEventLine>,
    pub context_findings: Vec<ContextFinding>,
    pub previous_summaries: Vec<String>,
}

/// Scripted LLM double: queued responses, captured calls, zero scores when
/// the queue runs dry
#[derive(Default)]
pub struct ScriptedLlm {
    pub score_queue: Mutex<VecDeque<Result<Vec<CriterionScores>, LlmError>>>,
    pub meta_queue: Mutex<VecDeque<Result<MetaAnalyzeResponse, LlmError>>>,
    pub score_calls: Mutex<Vec<Vec<ScoreEventLine>>>,
    pub meta_calls: Mutex<Vec<MetaCall>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scores(&self, scores: Vec<CriterionScores>) {
        self.score_queue.lock().unwrap().push_back(Ok(scores));
    }

    pub fn push_score_error(&self, error: LlmError) {
        self.score_queue.lock().unwrap().push_back(Err(error));
    }

    pub fn push_meta(&self, response: MetaAnalyzeResponse) {
        self.meta_queue.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_meta_error(&self, error: LlmError) {
        self.meta_queue.lock().unwrap().push_back(Err(error));
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn score_events(
        &self,
        _config: &AiConfig,
        events: &[ScoreEventLine],
        _system_description: &str,
        _source_labels: &[String],
        _opts: &ScoreOptions,
    ) -> Result<(Vec<CriterionScores>, LlmUsage), LlmError> {
        self.score_calls.lock().unwrap().push(events.to_vec());
        let next = self.score_queue.lock().unwrap().pop_front();
        match next {
            Some(Ok(mut scores)) => {
                scores.resize(events.len(), CriterionScores::default());
                Ok((scores, LlmUsage {
                    model: "test-model".into(),
                    input_tokens: 10,
                    output_tokens: 5,
                    request_count: 1,
                }))
            },
            Some(Err(e)) => Err(e),
            None => Ok((
                vec![CriterionScores::default(); events.len()],
                LlmUsage { model: "test-model".into(), request_count: 1, ..Default::default() },
            )),
        }
    }

    async fn meta_analyze(
        &self,
        _config: &AiConfig,
        events: &[MetaEventLine],
        _system_description: &str,
        _source_labels: &[String],
        context: &MetaContext,
        _opts: &MetaOptions,
    ) -> Result<(MetaAnalyzeResponse, LlmUsage), LlmError> {
        self.meta_calls.lock().unwrap().push(MetaCall {
            lines: events.to_vec(),
            context_findings: context.open_findings.clone(),
            previous_summaries: context.previous_summaries.clone(),
        });
        let next = self.meta_queue.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => Ok((response, LlmUsage {
                model: "test-model".into(),
                input_tokens: 20,
                output_tokens: 10,
                request_count: 1,
            })),
            Some(Err(e)) => Err(e),
            None => Ok((
                MetaAnalyzeResponse::default(),
                LlmUsage { model: "test-model".into(), request_count: 1, ..Default::default() },
            )),
        }
    }
}
