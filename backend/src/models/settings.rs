//! Typed views of the runtime configuration stored in the app_config table.
//!
//! Every key holds a JSON value; unknown fields are tolerated so older
//! configurations keep loading after upgrades.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// `dashboard_config`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct DashboardConfig {
    pub score_display_window_days: i64,
    pub reeval_window_days: i64,
    pub reeval_max_events: i64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { score_display_window_days: 7, reeval_window_days: 7, reeval_max_events: 500 }
    }
}

impl DashboardConfig {
    /// Clamp all values into their documented ranges.
    pub fn clamped(mut self) -> Self {
        self.score_display_window_days = self.score_display_window_days.clamp(1, 90);
        self.reeval_window_days = self.reeval_window_days.clamp(1, 90);
        self.reeval_max_events = self.reeval_max_events.clamp(50, 10_000);
        self
    }
}

/// `pipeline_config`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline_min_interval_minutes: i64,
    pub pipeline_max_interval_minutes: i64,
    pub window_minutes: i64,
    pub scoring_limit_per_run: i64,
    pub effective_score_meta_weight: f64,
    pub normalize_sql_statements: bool,
    pub multiline_reassembly: bool,
    pub max_future_drift_seconds: i64,
    pub max_event_message_length: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_min_interval_minutes: 15,
            pipeline_max_interval_minutes: 120,
            window_minutes: 5,
            scoring_limit_per_run: 500,
            effective_score_meta_weight: 0.7,
            normalize_sql_statements: false,
            multiline_reassembly: true,
            max_future_drift_seconds: 300,
            max_event_message_length: 8192,
        }
    }
}

/// `meta_analysis_config`
///
/// The auto_resolve_*/flapping_* keys of older configurations are accepted
/// (serde ignores unknown fields) but findings resolve only on event
/// evidence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct MetaAnalysisConfig {
    pub meta_max_events: i64,
    /// How many previous window summaries feed the context
    pub context_window_count: i64,
    pub dedup_threshold: f64,
    pub max_new_findings_per_window: i64,
    pub recurring_lookback_days: i64,
    pub max_open_findings_per_system: i64,
    pub meta_prioritize_high_scores: bool,
}

impl Default for MetaAnalysisConfig {
    fn default() -> Self {
        Self {
            meta_max_events: 500,
            context_window_count: 5,
            dedup_threshold: 0.6,
            max_new_findings_per_window: 3,
            recurring_lookback_days: 14,
            max_open_findings_per_system: 50,
            meta_prioritize_high_scores: true,
        }
    }
}

/// `event_ack_mode`: how acknowledged events are treated by meta-analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventAckMode {
    /// Acknowledged events are excluded entirely
    Skip,
    /// Acknowledged events are sent as context but not analyzed
    ContextOnly,
}

impl Default for EventAckMode {
    fn default() -> Self {
        Self::Skip
    }
}

/// `privacy_config`: the LLM-call-time privacy filter toggles. Stored data
/// is unaffected; events are transformed in memory before leaving for the
/// LLM.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct PrivacyConfig {
    pub mask_ipv4: bool,
    pub mask_ipv6: bool,
    pub mask_email: bool,
    pub mask_phone: bool,
    pub mask_url: bool,
    pub mask_user_paths: bool,
    pub mask_mac: bool,
    pub mask_credit_card: bool,
    pub mask_passwords: bool,
    pub mask_api_keys: bool,
    pub mask_usernames: bool,
    pub custom_patterns: Vec<String>,
    pub strip_host: bool,
    pub strip_program: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            mask_ipv4: false,
            mask_ipv6: false,
            mask_email: true,
            mask_phone: false,
            mask_url: false,
            mask_user_paths: true,
            mask_mac: false,
            mask_credit_card: true,
            mask_passwords: true,
            mask_api_keys: true,
            mask_usernames: false,
            custom_patterns: vec![],
            strip_host: false,
            strip_program: false,
        }
    }
}

/// `discovery_config`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `task_model_config`: per-task model overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct TaskModelConfig {
    pub scoring_model: Option<String>,
    pub meta_model: Option<String>,
    pub rag_model: Option<String>,
}
