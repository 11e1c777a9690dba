use axum::{
    Router,
    routing::{delete, get, post, put},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use syslens::config::Config;
use syslens::db;
use syslens::models;
use syslens::services::{
    AppConfigService, DashboardService, EventQueryService, FindingService, IngestService,
    MaintenanceTask, MetaAnalyzer, NoopAlertEvaluator, PipelineTask, RecalcService,
    ScoringService, SystemService, TemplateService, WindowService,
};
use syslens::services::llm::{LlmService, LlmServiceImpl};
use syslens::utils::ScheduledExecutor;
use syslens::{AppState, handlers};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::ingest::ingest,

        handlers::systems::dashboard_systems,
        handlers::systems::list_systems,
        handlers::systems::create_system,
        handlers::systems::get_system,
        handlers::systems::update_system,
        handlers::systems::delete_system,
        handlers::systems::list_sources,
        handlers::systems::create_source,
        handlers::systems::delete_source,
        handlers::systems::system_events,
        handlers::systems::system_meta,
        handlers::systems::system_findings,
        handlers::systems::recalculate_scores,
        handlers::systems::re_evaluate,
        handlers::systems::list_discovery,
        handlers::systems::clear_discovery,

        handlers::events::search_events,
        handlers::events::event_facets,
        handlers::events::event_trace,
        handlers::events::acknowledge_events,
        handlers::events::unacknowledge_events,

        handlers::findings::acknowledge_finding,
        handlers::findings::reopen_finding,

        handlers::templates::list_templates,
        handlers::templates::create_template,
        handlers::templates::get_template,
        handlers::templates::update_template,
        handlers::templates::delete_template,
        handlers::templates::preview_template,

        handlers::settings::get_setting,
        handlers::settings::put_setting,
        handlers::settings::llm_usage,
    ),
    components(
        schemas(
            models::Event,
            models::EventScore,
            models::IngestResponse,
            models::EventPage,
            models::EventFacets,
            models::FacetBucket,
            models::AckEventsRequest,
            models::AckEventsResponse,
            models::MonitoredSystem,
            models::LogSource,
            models::CreateSystemRequest,
            models::UpdateSystemRequest,
            models::CreateLogSourceRequest,
            models::DiscoveryEntry,
            models::SystemOverview,
            models::Window,
            models::MetaResultResponse,
            models::EffectiveScore,
            models::ReEvaluateRequest,
            models::Finding,
            models::NormalBehaviorTemplate,
            models::CreateTemplateRequest,
            models::UpdateTemplateRequest,
            models::PreviewTemplateRequest,
            models::PreviewTemplateResponse,
        )
    ),
    tags(
        (name = "Ingest", description = "Log event ingestion"),
        (name = "Dashboard", description = "Dashboard overview"),
        (name = "Systems", description = "Monitored system management"),
        (name = "Events", description = "Event search and acknowledgement"),
        (name = "Findings", description = "Finding lifecycle"),
        (name = "Templates", description = "Normal-behavior templates"),
        (name = "Settings", description = "Runtime configuration"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);

    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("syslens.log");

        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!("Syslens starting up");
    tracing::info!("Configuration loaded successfully");

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database pool created and migrations applied");

    let collector_tz: chrono_tz::Tz = config
        .ingest
        .collector_timezone
        .parse()
        .expect("collector timezone validated at config load");

    let config_service = Arc::new(AppConfigService::new(pool.clone()));
    let template_service = Arc::new(TemplateService::new(pool.clone()));
    let llm_service: Arc<dyn LlmService> = Arc::new(LlmServiceImpl::new());

    let ingest_service = Arc::new(IngestService::new(
        pool.clone(),
        Arc::clone(&config_service),
        collector_tz,
        config.ingest.max_batch_size,
    ));

    let event_query_service = Arc::new(EventQueryService::new(pool.clone()));
    let system_service = Arc::new(SystemService::new(pool.clone()));
    let dashboard_service = Arc::new(DashboardService::new(pool.clone()));
    let finding_service = Arc::new(FindingService::new(pool.clone()));

    let recalc_service = Arc::new(RecalcService::new(
        pool.clone(),
        Arc::clone(&config_service),
        Arc::clone(&template_service),
    ));

    let scoring_service = Arc::new(ScoringService::new(
        pool.clone(),
        Arc::clone(&config_service),
        Arc::clone(&template_service),
        Arc::clone(&llm_service),
    ));

    let window_service = Arc::new(WindowService::new(pool.clone(), Arc::clone(&config_service)));

    let meta_analyzer = Arc::new(MetaAnalyzer::new(
        pool.clone(),
        Arc::clone(&config_service),
        Arc::clone(&template_service),
        Arc::clone(&llm_service),
    ));

    let app_state = AppState {
        db: pool.clone(),
        config_service: Arc::clone(&config_service),
        ingest_service: Arc::clone(&ingest_service),
        event_query_service: Arc::clone(&event_query_service),
        system_service: Arc::clone(&system_service),
        dashboard_service: Arc::clone(&dashboard_service),
        finding_service: Arc::clone(&finding_service),
        template_service: Arc::clone(&template_service),
        recalc_service: Arc::clone(&recalc_service),
        window_service: Arc::clone(&window_service),
        meta_analyzer: Arc::clone(&meta_analyzer),
    };

    if config.pipeline.enabled {
        let pipeline_task = Arc::new(PipelineTask::new(
            Arc::clone(&config_service),
            Arc::clone(&scoring_service),
            Arc::clone(&window_service),
            Arc::clone(&meta_analyzer),
            Arc::new(NoopAlertEvaluator),
        ));
        let initial = config_service.pipeline_config().await;
        let interval =
            std::time::Duration::from_secs(initial.pipeline_min_interval_minutes.max(1) as u64 * 60);
        tracing::info!("Starting analysis pipeline (initial interval {:?})", interval);
        let executor = ScheduledExecutor::new("analysis-pipeline", interval);
        tokio::spawn(async move {
            executor.start(pipeline_task).await;
        });
    } else {
        tracing::warn!("Analysis pipeline disabled by configuration");
    }

    if config.pipeline.maintenance_enabled {
        let maintenance_task =
            Arc::new(MaintenanceTask::new(pool.clone(), Arc::clone(&config_service)));
        let hours = config_service.maintenance_interval_hours().await;
        let interval = std::time::Duration::from_secs(hours as u64 * 3600);
        tracing::info!("Starting retention maintenance (interval {:?})", interval);
        let executor = ScheduledExecutor::new("retention-maintenance", interval);
        tokio::spawn(async move {
            executor.start(maintenance_task).await;
        });
    }

    let app_state_arc = Arc::new(app_state);

    let api_routes = Router::new()
        .route("/api/v1/ingest", post(handlers::ingest::ingest))
        .route("/api/v1/dashboard/systems", get(handlers::systems::dashboard_systems))
        .route(
            "/api/v1/systems",
            get(handlers::systems::list_systems).post(handlers::systems::create_system),
        )
        .route(
            "/api/v1/systems/:id",
            get(handlers::systems::get_system)
                .put(handlers::systems::update_system)
                .delete(handlers::systems::delete_system),
        )
        .route(
            "/api/v1/systems/:id/sources",
            get(handlers::systems::list_sources).post(handlers::systems::create_source),
        )
        .route(
            "/api/v1/systems/:id/sources/:source_id",
            delete(handlers::systems::delete_source),
        )
        .route("/api/v1/systems/:id/events", get(handlers::systems::system_events))
        .route("/api/v1/systems/:id/meta", get(handlers::systems::system_meta))
        .route("/api/v1/systems/:id/findings", get(handlers::systems::system_findings))
        .route(
            "/api/v1/systems/:id/recalculate-scores",
            post(handlers::systems::recalculate_scores),
        )
        .route("/api/v1/systems/:id/re-evaluate", post(handlers::systems::re_evaluate))
        .route(
            "/api/v1/discovery",
            get(handlers::systems::list_discovery).delete(handlers::systems::clear_discovery),
        )
        .route("/api/v1/events/search", get(handlers::events::search_events))
        .route("/api/v1/events/facets", get(handlers::events::event_facets))
        .route("/api/v1/events/trace", get(handlers::events::event_trace))
        .route("/api/v1/events/acknowledge", post(handlers::events::acknowledge_events))
        .route("/api/v1/events/unacknowledge", post(handlers::events::unacknowledge_events))
        .route("/api/v1/findings/:id/acknowledge", put(handlers::findings::acknowledge_finding))
        .route("/api/v1/findings/:id/reopen", put(handlers::findings::reopen_finding))
        .route(
            "/api/v1/normal-behavior-templates",
            get(handlers::templates::list_templates).post(handlers::templates::create_template),
        )
        .route(
            "/api/v1/normal-behavior-templates/preview",
            post(handlers::templates::preview_template),
        )
        .route(
            "/api/v1/normal-behavior-templates/:id",
            get(handlers::templates::get_template)
                .put(handlers::templates::update_template)
                .delete(handlers::templates::delete_template),
        )
        .route(
            "/api/v1/settings/:key",
            get(handlers::settings::get_setting).put(handlers::settings::put_setting),
        )
        .route("/api/v1/llm/usage", get(handlers::settings::llm_usage))
        .route("/api/v1/scores/stream", get(handlers::stream::scores_stream))
        .with_state(Arc::clone(&app_state_arc));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_routes)
        .merge(health_routes);

    let app = app
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);
    tracing::info!("Syslens is ready to serve requests");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
