use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// One stored log record. Immutable after ingest except for acknowledged_at.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub system_id: Option<i64>,
    pub log_source_id: Option<i64>,
    pub connector_id: Option<String>,
    pub message: String,
    pub severity: Option<String>,
    pub host: Option<String>,
    pub source_ip: Option<String>,
    pub service: Option<String>,
    pub facility: Option<String>,
    pub program: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    /// Opaque shipper payload, stored as JSON text
    pub payload: Option<String>,
    pub normalized_hash: String,
    pub external_id: Option<String>,
    pub template_id: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Per-criterion score attached to an event
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct EventScore {
    pub event_id: String,
    pub criterion_id: i64,
    pub score_type: String,
    pub score: f64,
}

/// Response of the ingest endpoint
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

/// Query parameters for the events search endpoint
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EventSearchParams {
    /// Search text; matched per-word unless q_mode=contains
    pub q: Option<String>,
    /// "contains" switches q to a plain substring match
    pub q_mode: Option<String>,
    /// Comma-separated severity filter
    pub severity: Option<String>,
    /// Comma-separated host filter
    pub host: Option<String>,
    /// Comma-separated program filter
    pub program: Option<String>,
    pub system_id: Option<i64>,
    pub from_ts: Option<DateTime<Utc>>,
    pub to_ts: Option<DateTime<Utc>>,
    pub acknowledged: Option<bool>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// One page of events
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// Value counts for one facet column
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FacetBucket {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EventFacets {
    pub severity: Vec<FacetBucket>,
    pub host: Vec<FacetBucket>,
    pub program: Vec<FacetBucket>,
    pub facility: Vec<FacetBucket>,
}

/// Time-range acknowledge/unacknowledge request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AckEventsRequest {
    pub from_ts: DateTime<Utc>,
    pub to_ts: DateTime<Utc>,
    pub system_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AckEventsResponse {
    pub updated: u64,
}
