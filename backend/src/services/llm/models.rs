//! LLM Data Models
//!
//! Configuration, request/response shapes and errors for the two analysis
//! tasks (event scoring and window meta-analysis).

use serde::{Deserialize, Serialize};

use crate::models::TaskModelConfig;

// ============================================================================
// Configuration
// ============================================================================

/// Resolved LLM configuration, assembled from app_config.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub task_models: TaskModelConfig,
}

impl AiConfig {
    /// Model used for per-event scoring (per-task override or default).
    pub fn scoring_model(&self) -> &str {
        self.task_models.scoring_model.as_deref().unwrap_or(&self.model)
    }

    /// Model used for window meta-analysis.
    pub fn meta_model(&self) -> &str {
        self.task_models.meta_model.as_deref().unwrap_or(&self.model)
    }
}

/// Token usage of one LLM call.
#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub request_count: i64,
}

impl LlmUsage {
    /// Rough blended cost estimate for the usage dashboard.
    pub fn estimated_cost_usd(&self) -> f64 {
        (self.input_tokens as f64) * 0.15 / 1_000_000.0
            + (self.output_tokens as f64) * 0.60 / 1_000_000.0
    }
}

// ============================================================================
// Scoring task
// ============================================================================

/// One event sent to the scoring task (a template representative).
#[derive(Debug, Clone, Serialize)]
pub struct ScoreEventLine {
    pub index: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
}

/// Six per-criterion floats in [0,1]. Missing fields default to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriterionScores {
    pub it_security: f64,
    pub performance_degradation: f64,
    pub failure_prediction: f64,
    pub anomaly: f64,
    pub compliance_audit: f64,
    pub operational_risk: f64,
}

impl CriterionScores {
    pub fn get(&self, slug: &str) -> f64 {
        match slug {
            "it_security" => self.it_security,
            "performance_degradation" => self.performance_degradation,
            "failure_prediction" => self.failure_prediction,
            "anomaly" => self.anomaly,
            "compliance_audit" => self.compliance_audit,
            "operational_risk" => self.operational_risk,
            _ => 0.0,
        }
    }

    /// Clamp every value into [0,1]; NaN becomes 0.
    pub fn clamped(mut self) -> Self {
        for v in [
            &mut self.it_security,
            &mut self.performance_degradation,
            &mut self.failure_prediction,
            &mut self.anomaly,
            &mut self.compliance_audit,
            &mut self.operational_risk,
        ] {
            *v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        }
        self
    }

    pub fn is_all_zero(&self) -> bool {
        self.it_security == 0.0
            && self.performance_degradation == 0.0
            && self.failure_prediction == 0.0
            && self.anomaly == 0.0
            && self.compliance_audit == 0.0
            && self.operational_risk == 0.0
    }

    pub fn max_value(&self) -> f64 {
        [
            self.it_security,
            self.performance_degradation,
            self.failure_prediction,
            self.anomaly,
            self.compliance_audit,
            self.operational_risk,
        ]
        .into_iter()
        .fold(0.0_f64, f64::max)
    }
}

// ============================================================================
// Meta-analysis task
// ============================================================================

/// One deduplicated event line sent to meta-analysis (1-indexed).
#[derive(Debug, Clone, Serialize)]
pub struct MetaEventLine {
    pub line: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// How many stored events this line represents
    pub count: i64,
}

/// Existing finding presented to the LLM as context. The underscored fields
/// are bookkeeping echoes that must come back untouched in classifications.
#[derive(Debug, Clone, Serialize)]
pub struct ContextFinding {
    pub index: usize,
    pub text: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criterion: Option<String>,
    pub status: String,
    pub created_at: String,
    pub last_seen_at: String,
    pub occurrence_count: i64,
    #[serde(rename = "_dbId")]
    pub db_id: i64,
    #[serde(rename = "_fingerprint")]
    pub fingerprint: String,
    #[serde(rename = "_consecutive_misses")]
    pub consecutive_misses: i64,
}

/// Context handed to the meta prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetaContext {
    pub previous_summaries: Vec<String>,
    pub open_findings: Vec<ContextFinding>,
}

/// New finding proposed by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFindingCandidate {
    pub text: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub criterion: Option<String>,
}

/// Resolution entry: either the detailed evidence-carrying form or a bare
/// legacy index (which is rejected by the guardrails later).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResolvedEntry {
    Detailed {
        index: i64,
        #[serde(default)]
        evidence: String,
        #[serde(default)]
        event_refs: Vec<i64>,
    },
    Bare(i64),
}

/// Parsed meta-analysis response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetaAnalyzeResponse {
    pub meta_scores: CriterionScores,
    pub summary: String,
    pub new_findings: Vec<MetaFindingCandidate>,
    pub resolved_indices: Vec<ResolvedEntry>,
    pub still_active_indices: Vec<i64>,
    pub recommended_action: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// LLM call errors. All of them are absorbed at the component boundary:
/// scoring degrades to zero scores, meta-analysis to a zero result.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM response parsing error: {0}")]
    ParseError(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::ApiError(_))
    }
}
