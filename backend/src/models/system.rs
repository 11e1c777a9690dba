use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

/// A logical tenant: one monitored system owning sources, events, windows
/// and findings.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct MonitoredSystem {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Nullable; falls back to the global default_retention_days
    pub retention_days: Option<i64>,
    /// "relational" or "external"
    pub event_source: String,
    /// IANA timezone name, e.g. "Europe/Berlin"
    pub timezone_name: Option<String>,
    /// Fixed UTC offset in minutes; used when timezone_name is unset
    pub tz_offset_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stream feeding a system; the hint columns drive source matching.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct LogSource {
    pub id: i64,
    pub system_id: i64,
    pub label: String,
    pub host_hint: Option<String>,
    pub program_hint: Option<String>,
    pub source_ip_hint: Option<String>,
    pub connector_id_hint: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateSystemRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub description: Option<String>,
    #[validate(range(min = 1, max = 3650))]
    pub retention_days: Option<i64>,
    pub event_source: Option<String>,
    pub timezone_name: Option<String>,
    pub tz_offset_minutes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateSystemRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(range(min = 1, max = 3650))]
    pub retention_days: Option<i64>,
    pub timezone_name: Option<String>,
    pub tz_offset_minutes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateLogSourceRequest {
    #[validate(length(min = 1, max = 128))]
    pub label: String,
    pub host_hint: Option<String>,
    pub program_hint: Option<String>,
    pub source_ip_hint: Option<String>,
    pub connector_id_hint: Option<String>,
}

/// An unmatched ingest record parked for source-creation suggestions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct DiscoveryEntry {
    pub id: i64,
    pub host: Option<String>,
    pub source_ip: Option<String>,
    pub program: Option<String>,
    pub facility: Option<String>,
    pub severity: Option<String>,
    pub message_sample: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Dashboard card for one system: latest effective scores plus counters.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SystemOverview {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub open_findings: i64,
    pub last_window_id: Option<i64>,
    pub last_window_to_ts: Option<DateTime<Utc>>,
    /// criterion slug -> effective value of the latest window
    pub effective_scores: serde_json::Value,
}
