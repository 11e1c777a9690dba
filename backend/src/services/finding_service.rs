//! User-facing finding lifecycle operations.
//!
//! The pipeline owns every other transition; users may acknowledge an open
//! finding and reopen an acknowledged one. Resolved findings never reopen.

use sqlx::SqlitePool;

use crate::models::{Finding, STATUS_ACKNOWLEDGED, STATUS_OPEN};
use crate::utils::{ApiError, ApiResult};

#[derive(Clone)]
pub struct FindingService {
    pool: SqlitePool,
}

impl FindingService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_for_system(
        &self,
        system_id: i64,
        status: Option<&str>,
    ) -> ApiResult<Vec<Finding>> {
        let findings: Vec<Finding> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM findings WHERE system_id = ? AND status = ? \
                     ORDER BY last_seen_at DESC",
                )
                .bind(system_id)
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as(
                    "SELECT * FROM findings WHERE system_id = ? ORDER BY last_seen_at DESC",
                )
                .bind(system_id)
                .fetch_all(&self.pool)
                .await?
            },
        };
        Ok(findings)
    }

    pub async fn get(&self, finding_id: i64) -> ApiResult<Finding> {
        let finding: Option<Finding> = sqlx::query_as("SELECT * FROM findings WHERE id = ?")
            .bind(finding_id)
            .fetch_optional(&self.pool)
            .await?;
        finding.ok_or(ApiError::FindingNotFound { finding_id })
    }

    /// open -> acknowledged
    pub async fn acknowledge(&self, finding_id: i64) -> ApiResult<Finding> {
        let finding = self.get(finding_id).await?;
        if finding.status != STATUS_OPEN {
            return Err(ApiError::validation_error(format!(
                "Only open findings can be acknowledged (current status: {})",
                finding.status
            )));
        }

        sqlx::query("UPDATE findings SET status = 'acknowledged' WHERE id = ? AND status = 'open'")
            .bind(finding_id)
            .execute(&self.pool)
            .await?;

        tracing::info!("Finding {} acknowledged", finding_id);
        self.get(finding_id).await
    }

    /// acknowledged -> open. The only path out of a terminal state the user
    /// has; resolved findings stay resolved.
    pub async fn reopen(&self, finding_id: i64) -> ApiResult<Finding> {
        let finding = self.get(finding_id).await?;
        if finding.status != STATUS_ACKNOWLEDGED {
            return Err(ApiError::validation_error(format!(
                "Only acknowledged findings can be reopened (current status: {})",
                finding.status
            )));
        }

        sqlx::query(
            "UPDATE findings SET status = 'open', reopen_count = reopen_count + 1 \
             WHERE id = ? AND status = 'acknowledged'",
        )
        .bind(finding_id)
        .execute(&self.pool)
        .await?;

        tracing::info!("Finding {} reopened", finding_id);
        self.get(finding_id).await
    }
}
