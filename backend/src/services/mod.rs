pub mod app_config_service;
pub mod dashboard_service;
pub mod event_query_service;
pub mod finding_dedup;
pub mod finding_service;
pub mod ingest_service;
pub mod llm;
pub mod maintenance_task;
pub mod meta_analyzer;
pub mod normalizer;
pub mod pipeline_task;
pub mod privacy;
pub mod recalc_service;
pub mod redactor;
pub mod scoring_service;
pub mod source_matcher;
pub mod system_service;
pub mod template_service;
pub mod window_service;

pub use app_config_service::AppConfigService;
pub use dashboard_service::{DashboardService, LlmUsageDay};
pub use event_query_service::EventQueryService;
pub use finding_service::FindingService;
pub use ingest_service::IngestService;
pub use llm::{
    AiConfig, CriterionScores, LlmError, LlmService, LlmServiceImpl, LlmUsage,
    MetaAnalyzeResponse, MetaContext,
};
pub use maintenance_task::MaintenanceTask;
pub use meta_analyzer::{MetaAnalyzer, MetaRunOptions};
pub use pipeline_task::{AlertEvaluator, NoopAlertEvaluator, PipelineTask};
pub use privacy::PrivacyFilter;
pub use recalc_service::RecalcService;
pub use redactor::Redactor;
pub use scoring_service::ScoringService;
pub use source_matcher::SourceMatcher;
pub use system_service::SystemService;
pub use template_service::TemplateService;
pub use window_service::WindowService;
