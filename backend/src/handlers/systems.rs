use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;
use crate::models::{
    CreateLogSourceRequest, CreateSystemRequest, DiscoveryEntry, EventPage, Finding, LogSource,
    MetaResultResponse, MonitoredSystem, ReEvaluateRequest, SystemOverview, UpdateSystemRequest,
};
use crate::services::MetaRunOptions;
use crate::utils::ApiResult;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

// Dashboard cards for all systems
#[utoipa::path(
    get,
    path = "/api/v1/dashboard/systems",
    responses(
        (status = 200, description = "Per-system overview", body = Vec<SystemOverview>)
    ),
    tag = "Dashboard"
)]
pub async fn dashboard_systems(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<SystemOverview>>> {
    let overview = state.dashboard_service.systems_overview().await?;
    Ok(Json(overview))
}

#[utoipa::path(
    get,
    path = "/api/v1/systems",
    responses((status = 200, description = "All systems", body = Vec<MonitoredSystem>)),
    tag = "Systems"
)]
pub async fn list_systems(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<MonitoredSystem>>> {
    Ok(Json(state.system_service.list().await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/systems",
    request_body = CreateSystemRequest,
    responses((status = 200, description = "System created", body = MonitoredSystem)),
    tag = "Systems"
)]
pub async fn create_system(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSystemRequest>,
) -> ApiResult<Json<MonitoredSystem>> {
    Ok(Json(state.system_service.create(req).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/systems/{id}",
    params(("id" = i64, Path, description = "System ID")),
    responses(
        (status = 200, description = "System details", body = MonitoredSystem),
        (status = 404, description = "System not found")
    ),
    tag = "Systems"
)]
pub async fn get_system(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<MonitoredSystem>> {
    Ok(Json(state.system_service.get(id).await?))
}

#[utoipa::path(
    put,
    path = "/api/v1/systems/{id}",
    params(("id" = i64, Path, description = "System ID")),
    request_body = UpdateSystemRequest,
    responses((status = 200, description = "System updated", body = MonitoredSystem)),
    tag = "Systems"
)]
pub async fn update_system(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSystemRequest>,
) -> ApiResult<Json<MonitoredSystem>> {
    Ok(Json(state.system_service.update(id, req).await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/systems/{id}",
    params(("id" = i64, Path, description = "System ID")),
    responses((status = 200, description = "System deleted")),
    tag = "Systems"
)]
pub async fn delete_system(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.system_service.delete(id).await?;
    Ok(Json(serde_json::json!({"message": "System deleted"})))
}

#[utoipa::path(
    get,
    path = "/api/v1/systems/{id}/sources",
    params(("id" = i64, Path, description = "System ID")),
    responses((status = 200, description = "Log sources", body = Vec<LogSource>)),
    tag = "Systems"
)]
pub async fn list_sources(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<LogSource>>> {
    Ok(Json(state.system_service.list_sources(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/systems/{id}/sources",
    params(("id" = i64, Path, description = "System ID")),
    request_body = CreateLogSourceRequest,
    responses((status = 200, description = "Log source created", body = LogSource)),
    tag = "Systems"
)]
pub async fn create_source(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<CreateLogSourceRequest>,
) -> ApiResult<Json<LogSource>> {
    Ok(Json(state.system_service.create_source(id, req).await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/systems/{id}/sources/{source_id}",
    params(
        ("id" = i64, Path, description = "System ID"),
        ("source_id" = i64, Path, description = "Log source ID")
    ),
    responses((status = 200, description = "Log source deleted")),
    tag = "Systems"
)]
pub async fn delete_source(
    State(state): State<Arc<AppState>>,
    Path((id, source_id)): Path<(i64, i64)>,
) -> ApiResult<Json<serde_json::Value>> {
    state.system_service.delete_source(id, source_id).await?;
    Ok(Json(serde_json::json!({"message": "Log source deleted"})))
}

// Recent events of one system
#[utoipa::path(
    get,
    path = "/api/v1/systems/{id}/events",
    params(("id" = i64, Path, description = "System ID")),
    responses((status = 200, description = "Events page", body = EventPage)),
    tag = "Systems"
)]
pub async fn system_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<EventPage>> {
    state.system_service.get(id).await?;
    let page = state
        .event_query_service
        .system_events(id, params.page.unwrap_or(1), params.page_size.unwrap_or(50))
        .await?;
    Ok(Json(page))
}

// Meta-analysis history of one system
#[utoipa::path(
    get,
    path = "/api/v1/systems/{id}/meta",
    params(("id" = i64, Path, description = "System ID")),
    responses((status = 200, description = "Meta results", body = Vec<MetaResultResponse>)),
    tag = "Systems"
)]
pub async fn system_meta(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Json<Vec<MetaResultResponse>>> {
    state.system_service.get(id).await?;
    let history = state
        .dashboard_service
        .meta_history(id, params.limit.unwrap_or(20))
        .await?;
    Ok(Json(history))
}

#[utoipa::path(
    get,
    path = "/api/v1/systems/{id}/findings",
    params(("id" = i64, Path, description = "System ID")),
    responses((status = 200, description = "Findings", body = Vec<Finding>)),
    tag = "Systems"
)]
pub async fn system_findings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<StatusParams>,
) -> ApiResult<Json<Vec<Finding>>> {
    state.system_service.get(id).await?;
    let findings = state
        .finding_service
        .list_for_system(id, params.status.as_deref())
        .await?;
    Ok(Json(findings))
}

// Rebuild effective scores for one system
#[utoipa::path(
    post,
    path = "/api/v1/systems/{id}/recalculate-scores",
    params(("id" = i64, Path, description = "System ID")),
    responses((status = 200, description = "Scores recalculated")),
    tag = "Systems"
)]
pub async fn recalculate_scores(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.system_service.get(id).await?;
    let updated = state.recalc_service.recalculate(Some(id), false).await?;
    Ok(Json(serde_json::json!({"updated": updated})))
}

// Create a manual window over the recent span and analyze it immediately,
// with acknowledged events excluded and a fresh context
#[utoipa::path(
    post,
    path = "/api/v1/systems/{id}/re-evaluate",
    params(("id" = i64, Path, description = "System ID")),
    request_body = ReEvaluateRequest,
    responses(
        (status = 200, description = "Re-evaluation finished"),
        (status = 404, description = "System not found")
    ),
    tag = "Systems"
)]
pub async fn re_evaluate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ReEvaluateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let ai_config = state.config_service.ai_config().await?;

    let window = state
        .window_service
        .create_manual_window(id, req.window_days)
        .await?;
    tracing::info!("Manual re-evaluation window {} for system {}", window.id, id);

    let opts = MetaRunOptions { exclude_acknowledged: true, reset_context: true };
    let analyzed = state
        .meta_analyzer
        .analyze_window(window.id, &ai_config, &opts)
        .await?;

    Ok(Json(serde_json::json!({
        "window_id": window.id,
        "analyzed": analyzed,
    })))
}

// Unmatched ingest entries parked for source discovery
#[utoipa::path(
    get,
    path = "/api/v1/discovery",
    responses((status = 200, description = "Discovery buffer entries", body = Vec<DiscoveryEntry>)),
    tag = "Systems"
)]
pub async fn list_discovery(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Json<Vec<DiscoveryEntry>>> {
    let entries = state
        .system_service
        .list_discovery(params.limit.unwrap_or(200))
        .await?;
    Ok(Json(entries))
}

#[utoipa::path(
    delete,
    path = "/api/v1/discovery",
    responses((status = 200, description = "Discovery buffer cleared")),
    tag = "Systems"
)]
pub async fn clear_discovery(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = state.system_service.clear_discovery().await?;
    Ok(Json(serde_json::json!({"removed": removed})))
}
