//! Syslens Library
//!
//! This library contains all the core modules for the Syslens log-analysis
//! service: ingestion, normalization, scoring, windowing, meta-analysis and
//! the finding lifecycle.

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use services::llm::{LlmError, LlmService, LlmServiceImpl};
pub use services::{
    AppConfigService, DashboardService, EventQueryService, FindingService, IngestService,
    MaintenanceTask, MetaAnalyzer, PipelineTask, RecalcService, ScoringService, SystemService,
    TemplateService, WindowService,
};

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI
/// container. All services are wrapped in Arc for cheap cloning and thread
/// safety.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,

    pub config_service: Arc<AppConfigService>,
    pub ingest_service: Arc<IngestService>,
    pub event_query_service: Arc<EventQueryService>,
    pub system_service: Arc<SystemService>,
    pub dashboard_service: Arc<DashboardService>,
    pub finding_service: Arc<FindingService>,
    pub template_service: Arc<TemplateService>,
    pub recalc_service: Arc<RecalcService>,
    pub window_service: Arc<WindowService>,
    pub meta_analyzer: Arc<MetaAnalyzer>,
}

#[cfg(test)]
mod tests;
