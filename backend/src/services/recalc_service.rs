//! Recalculation engine: rebuild effective_scores after an acknowledge /
//! unacknowledge or a template change.
//!
//! For every effective_scores row inside the display window the per-window
//! per-criterion event maximum is recomputed - excluding acknowledged events
//! and, unless the caller knows template filtering is already reflected in
//! event_scores, excluding normal-behavior matches - and the blend is
//! re-derived with the original meta score (voided when the new max is
//! zero). When nothing was updated for a requested system, a seed row for
//! its latest window keeps the dashboard non-empty until the next
//! meta-analysis.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{CRITERIA, Window};
use crate::services::app_config_service::AppConfigService;
use crate::services::template_service::TemplateService;
use crate::utils::ApiResult;

pub struct RecalcService {
    pool: SqlitePool,
    config_service: Arc<AppConfigService>,
    template_service: Arc<TemplateService>,
}

impl RecalcService {
    pub fn new(
        pool: SqlitePool,
        config_service: Arc<AppConfigService>,
        template_service: Arc<TemplateService>,
    ) -> Self {
        Self { pool, config_service, template_service }
    }

    /// Rebuild effective scores. Returns the number of rows updated.
    pub async fn recalculate(
        &self,
        system_id: Option<i64>,
        skip_template_filter: bool,
    ) -> ApiResult<u64> {
        let dashboard = self.config_service.dashboard_config().await;
        let pipeline = self.config_service.pipeline_config().await;
        let meta_weight = pipeline.effective_score_meta_weight;
        let since = Utc::now() - chrono::Duration::days(dashboard.score_display_window_days);

        let normal_ids = if skip_template_filter {
            HashSet::new()
        } else {
            self.normal_event_ids(since).await?
        };

        let windows: Vec<Window> = match system_id {
            Some(system_id) => {
                sqlx::query_as(
                    "SELECT w.* FROM windows w \
                     WHERE w.system_id = ? AND w.to_ts >= ? \
                       AND EXISTS (SELECT 1 FROM effective_scores es WHERE es.window_id = w.id)",
                )
                .bind(system_id)
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as(
                    "SELECT w.* FROM windows w \
                     WHERE w.to_ts >= ? \
                       AND EXISTS (SELECT 1 FROM effective_scores es WHERE es.window_id = w.id)",
                )
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            },
        };

        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;

        for window in &windows {
            let maxes = self
                .window_criterion_maxes(&mut tx, window, &normal_ids)
                .await?;

            for criterion in CRITERIA {
                let new_max = maxes.get(&criterion.id).copied().unwrap_or(0.0);

                // Keep the original meta score, void its contribution when
                // no event backs it.
                let orig_meta: Option<f64> = sqlx::query_scalar(
                    "SELECT meta_score FROM effective_scores \
                     WHERE window_id = ? AND system_id = ? AND criterion_id = ?",
                )
                .bind(window.id)
                .bind(window.system_id)
                .bind(criterion.id)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(orig_meta) = orig_meta else {
                    continue;
                };

                let meta_effective = if new_max == 0.0 { 0.0 } else { orig_meta };
                let effective_value =
                    meta_weight * meta_effective + (1.0 - meta_weight) * new_max;

                let result = sqlx::query(
                    "UPDATE effective_scores SET max_event_score = ?, meta_score = ?, \
                     effective_value = ?, updated_at = CURRENT_TIMESTAMP \
                     WHERE window_id = ? AND system_id = ? AND criterion_id = ?",
                )
                .bind(new_max)
                .bind(meta_effective)
                .bind(effective_value)
                .bind(window.id)
                .bind(window.system_id)
                .bind(criterion.id)
                .execute(&mut *tx)
                .await?;
                updated += result.rows_affected();
            }
        }

        tx.commit().await?;

        // Seed path: an empty dashboard is worse than a meta-less one.
        if updated == 0 {
            if let Some(system_id) = system_id {
                updated = self.seed_latest_window(system_id, since, meta_weight, &normal_ids).await?;
            }
        }

        tracing::info!("Recalculated {} effective score rows", updated);
        Ok(updated)
    }

    /// Event ids inside the display window matching any enabled template.
    async fn normal_event_ids(
        &self,
        since: chrono::DateTime<Utc>,
    ) -> ApiResult<HashSet<String>> {
        let templates = self.template_service.compiled_templates().await?;
        if templates.is_empty() {
            return Ok(HashSet::new());
        }

        let rows: Vec<(String, Option<i64>, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT id, system_id, message, host, program FROM events WHERE timestamp >= ?",
            )
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, system_id, message, host, program)| {
                templates.iter().any(|t| {
                    t.matches(*system_id, message, host.as_deref(), program.as_deref())
                })
            })
            .map(|(id, ..)| id)
            .collect())
    }

    /// MAX(score) per criterion over one window's unacknowledged,
    /// non-normal events.
    async fn window_criterion_maxes(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        window: &Window,
        normal_ids: &HashSet<String>,
    ) -> ApiResult<HashMap<i64, f64>> {
        if normal_ids.is_empty() {
            let rows: Vec<(i64, f64)> = sqlx::query_as(
                "SELECT s.criterion_id, MAX(s.score) FROM event_scores s \
                 JOIN events e ON e.id = s.event_id \
                 WHERE e.system_id = ? AND e.timestamp >= ? AND e.timestamp < ? \
                   AND e.acknowledged_at IS NULL AND s.score_type = 'event' \
                 GROUP BY s.criterion_id",
            )
            .bind(window.system_id)
            .bind(window.from_ts)
            .bind(window.to_ts)
            .fetch_all(&mut **tx)
            .await?;
            return Ok(rows.into_iter().collect());
        }

        // With template exclusions the aggregation moves into Rust.
        let rows: Vec<(String, i64, f64)> = sqlx::query_as(
            "SELECT s.event_id, s.criterion_id, s.score FROM event_scores s \
             JOIN events e ON e.id = s.event_id \
             WHERE e.system_id = ? AND e.timestamp >= ? AND e.timestamp < ? \
               AND e.acknowledged_at IS NULL AND s.score_type = 'event'",
        )
        .bind(window.system_id)
        .bind(window.from_ts)
        .bind(window.to_ts)
        .fetch_all(&mut **tx)
        .await?;

        let mut maxes: HashMap<i64, f64> = HashMap::new();
        for (event_id, criterion_id, score) in rows {
            if normal_ids.contains(&event_id) {
                continue;
            }
            let entry = maxes.entry(criterion_id).or_insert(0.0);
            if score > *entry {
                *entry = score;
            }
        }
        Ok(maxes)
    }

    /// Insert meta_score=0 seed rows for the system's latest window.
    async fn seed_latest_window(
        &self,
        system_id: i64,
        since: chrono::DateTime<Utc>,
        meta_weight: f64,
        normal_ids: &HashSet<String>,
    ) -> ApiResult<u64> {
        let window: Option<Window> = sqlx::query_as(
            "SELECT * FROM windows WHERE system_id = ? AND to_ts >= ? \
             ORDER BY to_ts DESC LIMIT 1",
        )
        .bind(system_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        let Some(window) = window else {
            return Ok(0);
        };

        let mut tx = self.pool.begin().await?;
        let maxes = self.window_criterion_maxes(&mut tx, &window, normal_ids).await?;

        let mut seeded = 0u64;
        for criterion in CRITERIA {
            let max_score = maxes.get(&criterion.id).copied().unwrap_or(0.0);
            let effective_value = (1.0 - meta_weight) * max_score;

            let result = sqlx::query(
                "INSERT INTO effective_scores \
                 (window_id, system_id, criterion_id, effective_value, meta_score, \
                  max_event_score, updated_at) \
                 VALUES (?, ?, ?, ?, 0, ?, CURRENT_TIMESTAMP) \
                 ON CONFLICT (window_id, system_id, criterion_id) DO UPDATE SET \
                   effective_value = excluded.effective_value, \
                   meta_score = 0, \
                   max_event_score = excluded.max_event_score, \
                   updated_at = CURRENT_TIMESTAMP",
            )
            .bind(window.id)
            .bind(system_id)
            .bind(criterion.id)
            .bind(effective_value)
            .bind(max_score)
            .execute(&mut *tx)
            .await?;
            seeded += result.rows_affected();
        }

        tx.commit().await?;
        tracing::info!("Seeded effective scores for system {} window {}", system_id, window.id);
        Ok(seeded)
    }
}
