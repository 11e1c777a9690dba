use axum::{Json, extract::{ConnectInfo, State}, http::StatusCode, response::IntoResponse};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::AppState;
use crate::utils::ApiResult;

// Accept a shipper batch. 200 when at least one entry was accepted,
// 400 when the whole batch was rejected.
#[utoipa::path(
    post,
    path = "/api/v1/ingest",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Batch accepted (possibly partially)", body = IngestResponse),
        (status = 400, description = "No entry accepted")
    ),
    tag = "Ingest"
)]
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let response = state
        .ingest_service
        .ingest(body, Some(peer.ip().to_string()))
        .await?;

    let status = if response.accepted > 0 {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(response)))
}
