use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;
use crate::services::LlmUsageDay;
use crate::utils::{ApiError, ApiResult};

/// Runtime configuration keys writable through the API. Everything else in
/// app_config is internal.
const KNOWN_KEYS: &[&str] = &[
    "openai_api_key",
    "openai_model",
    "openai_base_url",
    "task_model_config",
    "scoring_system_prompt",
    "meta_system_prompt",
    "rag_system_prompt",
    "criterion_guide_it_security",
    "criterion_guide_performance_degradation",
    "criterion_guide_failure_prediction",
    "criterion_guide_anomaly",
    "criterion_guide_compliance_audit",
    "criterion_guide_operational_risk",
    "dashboard_config",
    "pipeline_config",
    "meta_analysis_config",
    "event_ack_mode",
    "event_ack_prompt",
    "default_retention_days",
    "maintenance_interval_hours",
    "discovery_config",
    "privacy_config",
    "redaction_patterns",
];

/// Keys whose value is never echoed back.
const SECRET_KEYS: &[&str] = &["openai_api_key"];

fn ensure_known(key: &str) -> ApiResult<()> {
    if KNOWN_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(ApiError::validation_error(format!("Unknown configuration key '{}'", key)))
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/settings/{key}",
    params(("key" = String, Path, description = "Configuration key")),
    responses(
        (status = 200, description = "Configuration value"),
        (status = 400, description = "Unknown key")
    ),
    tag = "Settings"
)]
pub async fn get_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_known(&key)?;

    if SECRET_KEYS.contains(&key.as_str()) {
        let configured = state.config_service.get_string(&key).await.is_some();
        return Ok(Json(serde_json::json!({"key": key, "configured": configured})));
    }

    let value = state.config_service.raw(&key).await?;
    Ok(Json(serde_json::json!({"key": key, "value": value})))
}

#[derive(Debug, Deserialize)]
pub struct PutSettingBody {
    pub value: serde_json::Value,
}

// Write one configuration key and drop the config caches so the change is
// picked up without a restart
#[utoipa::path(
    put,
    path = "/api/v1/settings/{key}",
    params(("key" = String, Path, description = "Configuration key")),
    responses(
        (status = 200, description = "Configuration updated"),
        (status = 400, description = "Unknown key")
    ),
    tag = "Settings"
)]
pub async fn put_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<PutSettingBody>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_known(&key)?;

    state.config_service.set(&key, &body.value).await?;
    state.config_service.invalidate();
    state.template_service.invalidate();

    tracing::info!("Configuration key '{}' updated", key);
    Ok(Json(serde_json::json!({"key": key, "updated": true})))
}

#[derive(Debug, Deserialize)]
pub struct UsageParams {
    pub days: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/api/v1/llm/usage",
    responses((status = 200, description = "Daily LLM usage", body = Vec<LlmUsageDay>)),
    tag = "Settings"
)]
pub async fn llm_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageParams>,
) -> ApiResult<Json<Vec<LlmUsageDay>>> {
    let usage = state
        .dashboard_service
        .llm_usage(params.days.unwrap_or(30))
        .await?;
    Ok(Json(usage))
}
