use axum::{
    Json,
    extract::{Query, State},
};
use std::sync::Arc;

use crate::AppState;
use crate::models::{
    AckEventsRequest, AckEventsResponse, Event, EventFacets, EventPage, EventSearchParams,
};
use crate::utils::{ApiError, ApiResult};

// Search events with filters, full-text/substring query and pagination
#[utoipa::path(
    get,
    path = "/api/v1/events/search",
    responses(
        (status = 200, description = "Matching events", body = EventPage),
        (status = 400, description = "Invalid filter or sort")
    ),
    tag = "Events"
)]
pub async fn search_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventSearchParams>,
) -> ApiResult<Json<EventPage>> {
    let page = state.event_query_service.search(&params).await?;
    Ok(Json(page))
}

// Facet counts for the current filter set
#[utoipa::path(
    get,
    path = "/api/v1/events/facets",
    responses(
        (status = 200, description = "Facet buckets", body = EventFacets)
    ),
    tag = "Events"
)]
pub async fn event_facets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventSearchParams>,
) -> ApiResult<Json<EventFacets>> {
    let facets = state.event_query_service.facets(&params).await?;
    Ok(Json(facets))
}

#[derive(Debug, serde::Deserialize)]
pub struct TraceParams {
    pub trace_id: String,
}

// All events of one trace, oldest first
#[utoipa::path(
    get,
    path = "/api/v1/events/trace",
    responses(
        (status = 200, description = "Events of the trace", body = Vec<Event>)
    ),
    tag = "Events"
)]
pub async fn event_trace(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TraceParams>,
) -> ApiResult<Json<Vec<Event>>> {
    if params.trace_id.trim().is_empty() {
        return Err(ApiError::validation_error("trace_id must not be empty"));
    }
    let events = state.event_query_service.trace(&params.trace_id).await?;
    Ok(Json(events))
}

// Acknowledge events in a time range; scores are rebuilt afterwards
#[utoipa::path(
    post,
    path = "/api/v1/events/acknowledge",
    request_body = AckEventsRequest,
    responses(
        (status = 200, description = "Events acknowledged", body = AckEventsResponse)
    ),
    tag = "Events"
)]
pub async fn acknowledge_events(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AckEventsRequest>,
) -> ApiResult<Json<AckEventsResponse>> {
    let response = state.event_query_service.acknowledge_range(&req).await?;
    state
        .recalc_service
        .recalculate(req.system_id, false)
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/events/unacknowledge",
    request_body = AckEventsRequest,
    responses(
        (status = 200, description = "Events unacknowledged", body = AckEventsResponse)
    ),
    tag = "Events"
)]
pub async fn unacknowledge_events(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AckEventsRequest>,
) -> ApiResult<Json<AckEventsResponse>> {
    let response = state.event_query_service.unacknowledge_range(&req).await?;
    state
        .recalc_service
        .recalculate(req.system_id, false)
        .await?;
    Ok(Json(response))
}
