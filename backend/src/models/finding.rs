use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// A persistent tracked issue with an explicit lifecycle.
///
/// Resolved findings are never reopened by the pipeline; only a resolution
/// carrying event evidence (or an explicit auto-close) moves a finding to
/// resolved, and only the user reopen API moves acknowledged back to open.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Finding {
    pub id: i64,
    pub system_id: i64,
    pub meta_result_id: Option<i64>,
    pub text: String,
    pub severity: String,
    pub criterion_slug: Option<String>,
    pub status: String,
    pub fingerprint: String,
    pub occurrence_count: i64,
    pub consecutive_misses: i64,
    pub reopen_count: i64,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by_meta_id: Option<i64>,
    /// JSON: {text, event_ids} or {reason, auto_resolved}
    pub resolution_evidence: Option<String>,
    /// JSON array of event ids
    pub key_event_ids: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Finding status values
pub const STATUS_OPEN: &str = "open";
pub const STATUS_ACKNOWLEDGED: &str = "acknowledged";
pub const STATUS_RESOLVED: &str = "resolved";

/// Severity rank used for upgrade-only escalation and eviction ordering.
pub fn severity_rank(severity: &str) -> i64 {
    match severity {
        "critical" => 4,
        "high" => 3,
        "medium" => 2,
        "low" => 1,
        _ => 0, // info and anything unknown
    }
}

/// Clamp an LLM-provided severity to the known set (unknown becomes info).
pub fn canonical_severity(severity: &str) -> &'static str {
    match severity.to_lowercase().as_str() {
        "critical" => "critical",
        "high" => "high",
        "medium" => "medium",
        "low" => "low",
        _ => "info",
    }
}

/// Evidence recorded when a finding is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResolutionEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub event_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resolved: Option<bool>,
}
