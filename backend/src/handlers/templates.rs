use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;

use crate::AppState;
use crate::models::{
    CreateTemplateRequest, NormalBehaviorTemplate, PreviewTemplateRequest,
    PreviewTemplateResponse, UpdateTemplateRequest,
};
use crate::utils::ApiResult;

#[utoipa::path(
    get,
    path = "/api/v1/normal-behavior-templates",
    responses((status = 200, description = "All templates", body = Vec<NormalBehaviorTemplate>)),
    tag = "Templates"
)]
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<NormalBehaviorTemplate>>> {
    Ok(Json(state.template_service.list().await?))
}

// Create a template and retroactively zero the scores of matching events
// over the display window
#[utoipa::path(
    post,
    path = "/api/v1/normal-behavior-templates",
    request_body = CreateTemplateRequest,
    responses(
        (status = 200, description = "Template created", body = NormalBehaviorTemplate),
        (status = 400, description = "Invalid pattern")
    ),
    tag = "Templates"
)]
pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTemplateRequest>,
) -> ApiResult<Json<NormalBehaviorTemplate>> {
    let template = state.template_service.create(req).await?;

    let dashboard = state.config_service.dashboard_config().await;
    let zeroed = state
        .template_service
        .zero_matching_scores(&template, dashboard.score_display_window_days)
        .await?;

    // The zeroing is already reflected in event_scores, so the rebuild can
    // skip the template filter.
    if !zeroed.is_empty() {
        state
            .recalc_service
            .recalculate(template.system_id, true)
            .await?;
    }

    Ok(Json(template))
}

#[utoipa::path(
    get,
    path = "/api/v1/normal-behavior-templates/{id}",
    params(("id" = i64, Path, description = "Template ID")),
    responses(
        (status = 200, description = "Template details", body = NormalBehaviorTemplate),
        (status = 404, description = "Template not found")
    ),
    tag = "Templates"
)]
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<NormalBehaviorTemplate>> {
    Ok(Json(state.template_service.get(id).await?))
}

#[utoipa::path(
    put,
    path = "/api/v1/normal-behavior-templates/{id}",
    params(("id" = i64, Path, description = "Template ID")),
    request_body = UpdateTemplateRequest,
    responses((status = 200, description = "Template updated", body = NormalBehaviorTemplate)),
    tag = "Templates"
)]
pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTemplateRequest>,
) -> ApiResult<Json<NormalBehaviorTemplate>> {
    let template = state.template_service.update(id, req).await?;
    // A changed pattern changes what counts as routine.
    state
        .recalc_service
        .recalculate(template.system_id, false)
        .await?;
    Ok(Json(template))
}

#[utoipa::path(
    delete,
    path = "/api/v1/normal-behavior-templates/{id}",
    params(("id" = i64, Path, description = "Template ID")),
    responses((status = 200, description = "Template deleted")),
    tag = "Templates"
)]
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let template = state.template_service.get(id).await?;
    state.template_service.delete(id).await?;
    state
        .recalc_service
        .recalculate(template.system_id, false)
        .await?;
    Ok(Json(serde_json::json!({"message": "Template deleted"})))
}

// Dry run: generate the pattern and show what it would match
#[utoipa::path(
    post,
    path = "/api/v1/normal-behavior-templates/preview",
    request_body = PreviewTemplateRequest,
    responses((status = 200, description = "Generated pattern and matches", body = PreviewTemplateResponse)),
    tag = "Templates"
)]
pub async fn preview_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PreviewTemplateRequest>,
) -> ApiResult<Json<PreviewTemplateResponse>> {
    let dashboard = state.config_service.dashboard_config().await;
    let preview = state
        .template_service
        .preview(req, dashboard.score_display_window_days)
        .await?;
    Ok(Json(preview))
}
