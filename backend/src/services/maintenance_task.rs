//! Retention maintenance: prune events past their retention window, drop
//! orphaned score rows and stale discovery entries.

use chrono::Utc;
use sqlx::SqlitePool;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::models::MonitoredSystem;
use crate::services::app_config_service::AppConfigService;
use crate::utils::ScheduledTask;

pub struct MaintenanceTask {
    pool: SqlitePool,
    config_service: Arc<AppConfigService>,
}

impl MaintenanceTask {
    pub fn new(pool: SqlitePool, config_service: Arc<AppConfigService>) -> Self {
        Self { pool, config_service }
    }

    pub async fn run_once(&self) -> anyhow::Result<Option<Duration>> {
        let default_retention = self.config_service.default_retention_days().await;
        let now = Utc::now();

        let systems: Vec<MonitoredSystem> = sqlx::query_as("SELECT * FROM monitored_systems")
            .fetch_all(&self.pool)
            .await?;

        let mut deleted_total = 0u64;
        for system in &systems {
            let retention = system.retention_days.unwrap_or(default_retention).max(1);
            let cutoff = now - chrono::Duration::days(retention);
            let result =
                sqlx::query("DELETE FROM events WHERE system_id = ? AND timestamp < ?")
                    .bind(system.id)
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?;
            deleted_total += result.rows_affected();
        }

        // Unmatched events age out on the global default.
        let cutoff = now - chrono::Duration::days(default_retention.max(1));
        let result = sqlx::query("DELETE FROM events WHERE system_id IS NULL AND timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        deleted_total += result.rows_affected();

        // Scores whose event is gone.
        let orphans = sqlx::query(
            "DELETE FROM event_scores WHERE event_id NOT IN (SELECT id FROM events)",
        )
        .execute(&self.pool)
        .await?;

        // Discovery entries are short-lived by nature.
        let discovery_cutoff = now - chrono::Duration::days(7);
        sqlx::query("DELETE FROM discovery_buffer WHERE received_at < ?")
            .bind(discovery_cutoff)
            .execute(&self.pool)
            .await?;

        if deleted_total > 0 || orphans.rows_affected() > 0 {
            tracing::info!(
                "Maintenance: deleted {} expired events, {} orphan scores",
                deleted_total,
                orphans.rows_affected()
            );
        }

        // The interval is runtime-tunable.
        let hours = self.config_service.maintenance_interval_hours().await;
        Ok(Some(Duration::from_secs((hours as u64) * 3600)))
    }
}

impl ScheduledTask for MaintenanceTask {
    fn run(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Duration>, anyhow::Error>> + Send + '_>> {
        Box::pin(async move { self.run_once().await })
    }
}
