use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

/// A user-authored normal-behavior pattern. Matching events are routine:
/// they are excluded from scoring and meta-analysis, and existing scores
/// are retroactively zeroed when the template is created.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct NormalBehaviorTemplate {
    pub id: i64,
    /// None = global template, applies to every system
    pub system_id: Option<i64>,
    /// Anchored, case-insensitive message regex
    pub pattern: String,
    pub host_pattern: Option<String>,
    pub program_pattern: Option<String>,
    pub example_message: Option<String>,
    pub enabled: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateTemplateRequest {
    pub system_id: Option<i64>,
    /// Explicit regex; when absent it is generated from example_message
    pub pattern: Option<String>,
    #[validate(length(min = 1, max = 8192))]
    pub example_message: Option<String>,
    pub host: Option<String>,
    pub program: Option<String>,
    pub notes: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateTemplateRequest {
    pub pattern: Option<String>,
    pub host_pattern: Option<String>,
    pub program_pattern: Option<String>,
    pub notes: Option<String>,
    pub enabled: Option<bool>,
}

/// Preview request: generate the pattern and show what it would match.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct PreviewTemplateRequest {
    #[validate(length(min = 1, max = 8192))]
    pub example_message: String,
    pub system_id: Option<i64>,
    pub host: Option<String>,
    pub program: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PreviewTemplateResponse {
    pub pattern: String,
    pub host_pattern: Option<String>,
    pub program_pattern: Option<String>,
    /// How many recent events the generated pattern matches
    pub matching_events: i64,
    pub sample_matches: Vec<String>,
}
