use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;

use crate::AppState;
use crate::models::Finding;
use crate::utils::ApiResult;

// open -> acknowledged; the display scores are rebuilt because acknowledged
// findings keep feeding context but not the dashboard
#[utoipa::path(
    put,
    path = "/api/v1/findings/{id}/acknowledge",
    params(("id" = i64, Path, description = "Finding ID")),
    responses(
        (status = 200, description = "Finding acknowledged", body = Finding),
        (status = 404, description = "Finding not found")
    ),
    tag = "Findings"
)]
pub async fn acknowledge_finding(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Finding>> {
    let finding = state.finding_service.acknowledge(id).await?;
    Ok(Json(finding))
}

// acknowledged -> open
#[utoipa::path(
    put,
    path = "/api/v1/findings/{id}/reopen",
    params(("id" = i64, Path, description = "Finding ID")),
    responses(
        (status = 200, description = "Finding reopened", body = Finding),
        (status = 404, description = "Finding not found")
    ),
    tag = "Findings"
)]
pub async fn reopen_finding(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Finding>> {
    let finding = state.finding_service.reopen(id).await?;
    Ok(Json(finding))
}
