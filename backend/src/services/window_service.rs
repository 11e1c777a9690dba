//! Windowing: roll fully-scored events into fixed-width intervals.
//!
//! Per system the cursor advances from the latest windowed to_ts in
//! interval steps up to now - guard (guard >= one interval, so every event
//! of a closed window has arrived and been scored). Intervals without
//! events are skipped by jumping to the next event; an interval with
//! unscored events blocks until the scoring job catches up.

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::models::{CRITERIA, MonitoredSystem, TRIGGER_MANUAL, TRIGGER_SCHEDULED, Window};
use crate::services::app_config_service::AppConfigService;
use crate::utils::{ApiError, ApiResult};

pub struct WindowService {
    pool: SqlitePool,
    config_service: Arc<AppConfigService>,
}

impl WindowService {
    pub fn new(pool: SqlitePool, config_service: Arc<AppConfigService>) -> Self {
        Self { pool, config_service }
    }

    /// Advance scheduled windows for every system. Returns the windows
    /// created by this pass.
    pub async fn run(&self) -> ApiResult<Vec<Window>> {
        let pipeline_config = self.config_service.pipeline_config().await;
        let interval = Duration::minutes(pipeline_config.window_minutes.max(1));
        let guard = interval;
        let horizon = Utc::now() - guard;

        let systems: Vec<MonitoredSystem> = sqlx::query_as("SELECT * FROM monitored_systems")
            .fetch_all(&self.pool)
            .await?;

        let mut created = Vec::new();
        for system in systems {
            match self.advance_system(&system, interval, horizon).await {
                Ok(mut windows) => created.append(&mut windows),
                Err(e) => {
                    tracing::error!("Windowing failed for system {}: {}", system.id, e);
                },
            }
        }
        Ok(created)
    }

    async fn advance_system(
        &self,
        system: &MonitoredSystem,
        interval: Duration,
        horizon: DateTime<Utc>,
    ) -> ApiResult<Vec<Window>> {
        let last_to: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(to_ts) FROM windows WHERE system_id = ?")
                .bind(system.id)
                .fetch_one(&self.pool)
                .await?;

        let mut cursor = match last_to {
            Some(ts) => ts,
            None => {
                // Start at the first event, floored to an interval boundary.
                let first: Option<DateTime<Utc>> = sqlx::query_scalar(
                    "SELECT MIN(timestamp) FROM events WHERE system_id = ?",
                )
                .bind(system.id)
                .fetch_one(&self.pool)
                .await?;
                match first {
                    Some(ts) => floor_to_interval(ts, interval),
                    None => return Ok(vec![]),
                }
            },
        };

        let mut created = Vec::new();
        while cursor + interval <= horizon {
            let from_ts = cursor;
            let to_ts = cursor + interval;

            let event_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM events \
                 WHERE system_id = ? AND timestamp >= ? AND timestamp < ?",
            )
            .bind(system.id)
            .bind(from_ts)
            .bind(to_ts)
            .fetch_one(&self.pool)
            .await?;

            if event_count == 0 {
                // Jump to the next populated interval instead of stepping
                // through a quiet period window by window.
                let next: Option<DateTime<Utc>> = sqlx::query_scalar(
                    "SELECT MIN(timestamp) FROM events WHERE system_id = ? AND timestamp >= ?",
                )
                .bind(system.id)
                .bind(to_ts)
                .fetch_one(&self.pool)
                .await?;
                match next {
                    Some(ts) if floor_to_interval(ts, interval) + interval <= horizon => {
                        cursor = floor_to_interval(ts, interval);
                        continue;
                    },
                    _ => break,
                }
            }

            let unscored: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM events e \
                 WHERE e.system_id = ? AND e.timestamp >= ? AND e.timestamp < ? \
                   AND (SELECT COUNT(DISTINCT s.criterion_id) FROM event_scores s \
                        WHERE s.event_id = e.id AND s.score_type = 'event') < ?",
            )
            .bind(system.id)
            .bind(from_ts)
            .bind(to_ts)
            .bind(CRITERIA.len() as i64)
            .fetch_one(&self.pool)
            .await?;

            if unscored > 0 {
                // Scoring has not caught up yet; retry on the next tick.
                break;
            }

            let window = self
                .insert_window(system.id, from_ts, to_ts, TRIGGER_SCHEDULED)
                .await?;
            created.push(window);
            cursor = to_ts;
        }

        Ok(created)
    }

    /// Create a single manual window covering the re-evaluation span.
    pub async fn create_manual_window(
        &self,
        system_id: i64,
        window_days: Option<i64>,
    ) -> ApiResult<Window> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM monitored_systems WHERE id = ?")
                .bind(system_id)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(ApiError::SystemNotFound { system_id });
        }

        let dashboard = self.config_service.dashboard_config().await;
        let days = window_days
            .unwrap_or(dashboard.reeval_window_days)
            .clamp(1, 90);

        let to_ts = Utc::now();
        let from_ts = to_ts - Duration::days(days);
        self.insert_window(system_id, from_ts, to_ts, TRIGGER_MANUAL).await
    }

    async fn insert_window(
        &self,
        system_id: i64,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
        trigger: &str,
    ) -> ApiResult<Window> {
        let result = sqlx::query(
            "INSERT INTO windows (system_id, from_ts, to_ts, trigger_kind) VALUES (?, ?, ?, ?)",
        )
        .bind(system_id)
        .bind(from_ts)
        .bind(to_ts)
        .bind(trigger)
        .execute(&self.pool)
        .await?;

        let window: Window = sqlx::query_as("SELECT * FROM windows WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        Ok(window)
    }

    pub async fn get(&self, window_id: i64) -> ApiResult<Window> {
        let window: Option<Window> = sqlx::query_as("SELECT * FROM windows WHERE id = ?")
            .bind(window_id)
            .fetch_optional(&self.pool)
            .await?;
        window.ok_or(ApiError::WindowNotFound { window_id })
    }
}

fn floor_to_interval(ts: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_secs = interval.num_seconds().max(1);
    let floored = (ts.timestamp() / interval_secs) * interval_secs;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}
