//! Monitored system and log source management.

use sqlx::SqlitePool;
use validator::Validate;

use crate::models::{
    CreateLogSourceRequest, CreateSystemRequest, DiscoveryEntry, LogSource, MonitoredSystem,
    UpdateSystemRequest,
};
use crate::utils::{ApiError, ApiResult};

#[derive(Clone)]
pub struct SystemService {
    pool: SqlitePool,
}

impl SystemService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> ApiResult<Vec<MonitoredSystem>> {
        let systems: Vec<MonitoredSystem> =
            sqlx::query_as("SELECT * FROM monitored_systems ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(systems)
    }

    pub async fn get(&self, system_id: i64) -> ApiResult<MonitoredSystem> {
        let system: Option<MonitoredSystem> =
            sqlx::query_as("SELECT * FROM monitored_systems WHERE id = ?")
                .bind(system_id)
                .fetch_optional(&self.pool)
                .await?;
        system.ok_or(ApiError::SystemNotFound { system_id })
    }

    pub async fn create(&self, req: CreateSystemRequest) -> ApiResult<MonitoredSystem> {
        req.validate()
            .map_err(|e| ApiError::validation_error(e.to_string()))?;
        validate_timezone(req.timezone_name.as_deref())?;

        let event_source = req.event_source.as_deref().unwrap_or("relational");
        if !["relational", "external"].contains(&event_source) {
            return Err(ApiError::validation_error(
                "event_source must be 'relational' or 'external'",
            ));
        }

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM monitored_systems WHERE name = ?")
                .bind(&req.name)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(ApiError::validation_error("A system with this name already exists"));
        }

        let result = sqlx::query(
            "INSERT INTO monitored_systems \
             (name, description, retention_days, event_source, timezone_name, tz_offset_minutes) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.retention_days)
        .bind(event_source)
        .bind(&req.timezone_name)
        .bind(req.tz_offset_minutes)
        .execute(&self.pool)
        .await?;

        tracing::info!("Created monitored system '{}'", req.name);
        self.get(result.last_insert_rowid()).await
    }

    pub async fn update(
        &self,
        system_id: i64,
        req: UpdateSystemRequest,
    ) -> ApiResult<MonitoredSystem> {
        req.validate()
            .map_err(|e| ApiError::validation_error(e.to_string()))?;
        validate_timezone(req.timezone_name.as_deref())?;
        let existing = self.get(system_id).await?;

        sqlx::query(
            "UPDATE monitored_systems SET name = ?, description = ?, retention_days = ?, \
             timezone_name = ?, tz_offset_minutes = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?",
        )
        .bind(req.name.unwrap_or(existing.name))
        .bind(req.description.or(existing.description))
        .bind(req.retention_days.or(existing.retention_days))
        .bind(req.timezone_name.or(existing.timezone_name))
        .bind(req.tz_offset_minutes.or(existing.tz_offset_minutes))
        .bind(system_id)
        .execute(&self.pool)
        .await?;

        self.get(system_id).await
    }

    pub async fn delete(&self, system_id: i64) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM monitored_systems WHERE id = ?")
            .bind(system_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::SystemNotFound { system_id });
        }
        tracing::warn!("Deleted monitored system {}", system_id);
        Ok(())
    }

    pub async fn list_sources(&self, system_id: i64) -> ApiResult<Vec<LogSource>> {
        self.get(system_id).await?;
        let sources: Vec<LogSource> =
            sqlx::query_as("SELECT * FROM log_sources WHERE system_id = ? ORDER BY id")
                .bind(system_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(sources)
    }

    pub async fn create_source(
        &self,
        system_id: i64,
        req: CreateLogSourceRequest,
    ) -> ApiResult<LogSource> {
        req.validate()
            .map_err(|e| ApiError::validation_error(e.to_string()))?;
        self.get(system_id).await?;

        if req.host_hint.is_none()
            && req.program_hint.is_none()
            && req.source_ip_hint.is_none()
            && req.connector_id_hint.is_none()
        {
            return Err(ApiError::validation_error(
                "A log source needs at least one matching hint",
            ));
        }

        let result = sqlx::query(
            "INSERT INTO log_sources \
             (system_id, label, host_hint, program_hint, source_ip_hint, connector_id_hint) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(system_id)
        .bind(&req.label)
        .bind(&req.host_hint)
        .bind(&req.program_hint)
        .bind(&req.source_ip_hint)
        .bind(&req.connector_id_hint)
        .execute(&self.pool)
        .await?;

        let source: LogSource = sqlx::query_as("SELECT * FROM log_sources WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn delete_source(&self, system_id: i64, source_id: i64) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM log_sources WHERE id = ? AND system_id = ?")
            .bind(source_id)
            .bind(system_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::not_found("Log source not found"));
        }
        Ok(())
    }

    pub async fn list_discovery(&self, limit: i64) -> ApiResult<Vec<DiscoveryEntry>> {
        let entries: Vec<DiscoveryEntry> = sqlx::query_as(
            "SELECT * FROM discovery_buffer ORDER BY received_at DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn clear_discovery(&self) -> ApiResult<u64> {
        let result = sqlx::query("DELETE FROM discovery_buffer")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn validate_timezone(name: Option<&str>) -> ApiResult<()> {
    if let Some(name) = name {
        if name.parse::<chrono_tz::Tz>().is_err() {
            return Err(ApiError::validation_error(format!(
                "'{}' is not a valid IANA timezone name",
                name
            )));
        }
    }
    Ok(())
}
