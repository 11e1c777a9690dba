//! Dashboard read models: per-system overview cards, meta-result history
//! and LLM usage aggregates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;

use crate::models::{
    CRITERIA, EffectiveScore, MetaResult, MetaResultResponse, MonitoredSystem, SystemOverview,
    Window,
};
use crate::utils::ApiResult;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LlmUsageDay {
    pub date: String,
    pub task: String,
    pub model: String,
    pub total_requests: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub estimated_cost_usd: f64,
}

#[derive(Clone)]
pub struct DashboardService {
    pool: SqlitePool,
}

impl DashboardService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// One card per system: open findings, latest window, its effective
    /// scores keyed by criterion slug.
    pub async fn systems_overview(&self) -> ApiResult<Vec<SystemOverview>> {
        let systems: Vec<MonitoredSystem> =
            sqlx::query_as("SELECT * FROM monitored_systems ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        let mut overview = Vec::with_capacity(systems.len());
        for system in systems {
            let open_findings: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM findings WHERE system_id = ? AND status = 'open'",
            )
            .bind(system.id)
            .fetch_one(&self.pool)
            .await?;

            let last_window: Option<Window> = sqlx::query_as(
                "SELECT * FROM windows WHERE system_id = ? ORDER BY to_ts DESC LIMIT 1",
            )
            .bind(system.id)
            .fetch_optional(&self.pool)
            .await?;

            let mut scores = serde_json::Map::new();
            if let Some(window) = &last_window {
                let rows: Vec<EffectiveScore> = sqlx::query_as(
                    "SELECT * FROM effective_scores WHERE window_id = ? AND system_id = ?",
                )
                .bind(window.id)
                .bind(system.id)
                .fetch_all(&self.pool)
                .await?;
                for row in rows {
                    if let Some(criterion) = CRITERIA.iter().find(|c| c.id == row.criterion_id) {
                        scores.insert(
                            criterion.slug.to_string(),
                            serde_json::json!(row.effective_value),
                        );
                    }
                }
            }

            overview.push(SystemOverview {
                id: system.id,
                name: system.name,
                description: system.description,
                open_findings,
                last_window_id: last_window.as_ref().map(|w| w.id),
                last_window_to_ts: last_window.as_ref().map(|w| w.to_ts),
                effective_scores: serde_json::Value::Object(scores),
            });
        }

        Ok(overview)
    }

    /// Recent meta results of one system, JSON columns decoded leniently.
    pub async fn meta_history(
        &self,
        system_id: i64,
        limit: i64,
    ) -> ApiResult<Vec<MetaResultResponse>> {
        let results: Vec<MetaResult> = sqlx::query_as(
            "SELECT m.* FROM meta_results m \
             JOIN windows w ON w.id = m.window_id \
             WHERE w.system_id = ? ORDER BY m.created_at DESC LIMIT ?",
        )
        .bind(system_id)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;

        Ok(results.into_iter().map(MetaResultResponse::from).collect())
    }

    /// Meta results created after the given instant (SSE updates).
    pub async fn meta_results_since(
        &self,
        since: DateTime<Utc>,
    ) -> ApiResult<Vec<MetaResultResponse>> {
        let results: Vec<MetaResult> = sqlx::query_as(
            "SELECT * FROM meta_results WHERE created_at >= ? ORDER BY created_at ASC LIMIT 100",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(results.into_iter().map(MetaResultResponse::from).collect())
    }

    /// Daily LLM usage aggregates for the usage page.
    pub async fn llm_usage(&self, days: i64) -> ApiResult<Vec<LlmUsageDay>> {
        let since = Utc::now() - chrono::Duration::days(days.clamp(1, 365));
        let rows: Vec<(String, String, String, i64, i64, i64, f64)> = sqlx::query_as(
            "SELECT DATE(created_at), task, model, SUM(request_count), SUM(input_tokens), \
             SUM(output_tokens), COALESCE(SUM(estimated_cost_usd), 0) \
             FROM llm_usage WHERE created_at >= ? \
             GROUP BY DATE(created_at), task, model \
             ORDER BY DATE(created_at) DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(date, task, model, requests, input, output, cost)| LlmUsageDay {
                    date,
                    task,
                    model,
                    total_requests: requests,
                    total_input_tokens: input,
                    total_output_tokens: output,
                    estimated_cost_usd: cost,
                },
            )
            .collect())
    }
}
