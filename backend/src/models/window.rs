use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// A closed time interval over one system's events.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Window {
    pub id: i64,
    pub system_id: i64,
    pub from_ts: DateTime<Utc>,
    pub to_ts: DateTime<Utc>,
    pub trigger_kind: String,
    pub created_at: DateTime<Utc>,
}

/// Window trigger kinds
pub const TRIGGER_SCHEDULED: &str = "scheduled";
pub const TRIGGER_MANUAL: &str = "manual";

/// Raw meta-analysis row; the JSON columns are stored as text.
#[derive(Debug, Clone, FromRow)]
pub struct MetaResult {
    pub id: i64,
    pub window_id: i64,
    pub meta_scores: String,
    pub summary: Option<String>,
    pub findings: Option<String>,
    pub recommended_action: Option<String>,
    pub key_event_ids: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// API shape of a meta result with the JSON columns decoded.
/// Unparseable stored JSON degrades to the raw string instead of failing
/// the endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetaResultResponse {
    pub id: i64,
    pub window_id: i64,
    pub meta_scores: serde_json::Value,
    pub summary: Option<String>,
    pub findings: serde_json::Value,
    pub recommended_action: Option<String>,
    pub key_event_ids: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<MetaResult> for MetaResultResponse {
    fn from(m: MetaResult) -> Self {
        Self {
            id: m.id,
            window_id: m.window_id,
            meta_scores: lenient_json(&m.meta_scores),
            summary: m.summary,
            findings: m.findings.as_deref().map(lenient_json).unwrap_or(serde_json::Value::Null),
            recommended_action: m.recommended_action,
            key_event_ids: m
                .key_event_ids
                .as_deref()
                .map(lenient_json)
                .unwrap_or(serde_json::Value::Null),
            created_at: m.created_at,
        }
    }
}

/// Parse stored JSON, falling back to the raw string value.
fn lenient_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Dashboard-facing per-criterion blend of meta score and event max.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct EffectiveScore {
    pub window_id: i64,
    pub system_id: i64,
    pub criterion_id: i64,
    pub effective_value: f64,
    pub meta_score: f64,
    pub max_event_score: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ReEvaluateRequest {
    /// Span in days for the manual window (default: reeval_window_days)
    pub window_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_json_falls_back_to_raw() {
        assert_eq!(lenient_json("{\"a\":1}"), serde_json::json!({"a": 1}));
        assert_eq!(
            lenient_json("not json at all"),
            serde_json::Value::String("not json at all".to_string())
        );
    }
}
