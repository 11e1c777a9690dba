//! Runtime configuration stored in the app_config table.
//!
//! Values are JSON; reads go through a short-lived in-process cache so the
//! pipeline can poll configuration every tick without hammering the store.
//! Admin writes call invalidate() so UI changes take effect without restart.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use std::time::{Duration, Instant};

use crate::models::{
    DashboardConfig, DiscoveryConfig, EventAckMode, MetaAnalysisConfig, PipelineConfig,
    PrivacyConfig, TaskModelConfig,
};
use crate::services::llm::AiConfig;
use crate::utils::{ApiError, ApiResult};

const CACHE_TTL: Duration = Duration::from_secs(30);

struct CachedEntry {
    value: Option<serde_json::Value>,
    fetched_at: Instant,
}

pub struct AppConfigService {
    pool: SqlitePool,
    cache: DashMap<String, CachedEntry>,
}

impl AppConfigService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, cache: DashMap::new() }
    }

    /// Raw cached read of one key.
    pub async fn raw(&self, key: &str) -> ApiResult<Option<serde_json::Value>> {
        if let Some(entry) = self.cache.get(key) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return Ok(entry.value.clone());
            }
        }

        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM app_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let value = match raw {
            Some(text) => match serde_json::from_str(&text) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("app_config key '{}' holds invalid JSON: {}", key, e);
                    Some(serde_json::Value::String(text))
                },
            },
            None => None,
        };

        self.cache
            .insert(key.to_string(), CachedEntry { value: value.clone(), fetched_at: Instant::now() });
        Ok(value)
    }

    /// Typed read with fallback to the type's default on absence or shape
    /// mismatch. Config never takes the pipeline down.
    pub async fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.raw(key).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("app_config key '{}' has unexpected shape: {}", key, e);
                T::default()
            }),
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!("Failed to read app_config key '{}': {}", key, e);
                T::default()
            },
        }
    }

    /// Read a plain string key.
    pub async fn get_string(&self, key: &str) -> Option<String> {
        match self.raw(key).await {
            Ok(Some(serde_json::Value::String(s))) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }

    /// Upsert one key and drop it from the cache.
    pub async fn set(&self, key: &str, value: &serde_json::Value) -> ApiResult<()> {
        let text = serde_json::to_string(value)?;
        sqlx::query(
            r#"INSERT INTO app_config (key, value, updated_at)
               VALUES (?, ?, CURRENT_TIMESTAMP)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                              updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(key)
        .bind(text)
        .execute(&self.pool)
        .await?;

        self.cache.remove(key);
        Ok(())
    }

    /// Drop every cached entry. Called after admin writes.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    pub async fn dashboard_config(&self) -> DashboardConfig {
        self.get_or_default::<DashboardConfig>("dashboard_config").await.clamped()
    }

    pub async fn pipeline_config(&self) -> PipelineConfig {
        self.get_or_default("pipeline_config").await
    }

    pub async fn meta_analysis_config(&self) -> MetaAnalysisConfig {
        self.get_or_default("meta_analysis_config").await
    }

    pub async fn privacy_config(&self) -> PrivacyConfig {
        self.get_or_default("privacy_config").await
    }

    pub async fn discovery_config(&self) -> DiscoveryConfig {
        self.get_or_default("discovery_config").await
    }

    pub async fn event_ack_mode(&self) -> EventAckMode {
        self.get_or_default("event_ack_mode").await
    }

    pub async fn event_ack_prompt(&self) -> Option<String> {
        self.get_string("event_ack_prompt").await
    }

    pub async fn default_retention_days(&self) -> i64 {
        match self.raw("default_retention_days").await {
            Ok(Some(serde_json::Value::Number(n))) => n.as_i64().unwrap_or(90),
            _ => 90,
        }
    }

    pub async fn maintenance_interval_hours(&self) -> i64 {
        match self.raw("maintenance_interval_hours").await {
            Ok(Some(serde_json::Value::Number(n))) => n.as_i64().unwrap_or(6).max(1),
            _ => 6,
        }
    }

    /// Extra user-provided redaction patterns, applied after the builtins.
    pub async fn redaction_patterns(&self) -> Vec<String> {
        self.get_or_default("redaction_patterns").await
    }

    pub async fn scoring_system_prompt(&self) -> Option<String> {
        self.get_string("scoring_system_prompt").await
    }

    pub async fn meta_system_prompt(&self) -> Option<String> {
        self.get_string("meta_system_prompt").await
    }

    /// Per-criterion guideline override, e.g. key `criterion_guide_anomaly`.
    pub async fn criterion_guide(&self, slug: &str) -> Option<String> {
        self.get_string(&format!("criterion_guide_{}", slug)).await
    }

    /// Assemble the LLM configuration. Returns Err(AiNotConfigured) when no
    /// API key is set.
    pub async fn ai_config(&self) -> ApiResult<AiConfig> {
        self.ai_config_optional().await.ok_or(ApiError::AiNotConfigured)
    }

    /// Like ai_config but None instead of an error; the pipeline uses this
    /// to skip silently.
    pub async fn ai_config_optional(&self) -> Option<AiConfig> {
        let api_key = self.get_string("openai_api_key").await?;
        let model = self
            .get_string("openai_model")
            .await
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let base_url = self
            .get_string("openai_base_url")
            .await
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let task_models: TaskModelConfig = self.get_or_default("task_model_config").await;

        Some(AiConfig { api_key, model, base_url, task_models })
    }
}
