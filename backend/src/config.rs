use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub ingest: IngestConfig,
    pub pipeline: PipelineBootConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Ingest endpoint limits and collector identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Hard cap on entries per ingest request (default: 1000)
    pub max_batch_size: usize,
    /// IANA timezone the collector host runs in (default: UTC).
    /// Used as the reference side of per-system timezone correction.
    pub collector_timezone: String,
}

/// Process-level switches for the background pipeline. Runtime tuning
/// (intervals, limits) lives in the app_config table instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineBootConfig {
    /// Whether to start the analysis pipeline at startup (default: true)
    pub enabled: bool,
    /// Whether to start the retention maintenance task (default: true)
    pub maintenance_enabled: bool,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "syslens")]
#[command(version, about = "Syslens - AI log analysis service")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,syslens=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Max entries per ingest request (overrides config file)
    #[arg(long, value_name = "N")]
    pub max_batch_size: Option<usize>,

    /// Collector timezone (overrides config file, e.g., "Europe/Berlin")
    #[arg(long, value_name = "TZ")]
    pub collector_timezone: Option<String>,

    /// Enable/disable the analysis pipeline (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub pipeline_enabled: Option<bool>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(&cli_args)
    }

    /// Load with pre-parsed arguments (exposed for tests)
    pub fn load_with_args(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        // 1. Load from config file (use CLI --config if provided, otherwise find default)
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        // 2. Override with environment variables
        config.apply_env_overrides();

        // 3. Override with command line arguments (highest priority)
        config.apply_cli_overrides(cli_args);

        // 4. Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST: Server host (default: 0.0.0.0)
    /// - APP_SERVER_PORT: Server port (default: 8080)
    /// - APP_DATABASE_URL: Database URL (default: sqlite://data/syslens.db)
    /// - APP_LOG_LEVEL: Logging level (e.g., "info,syslens=debug")
    /// - APP_MAX_BATCH_SIZE: Max entries per ingest request
    /// - APP_COLLECTOR_TIMEZONE: Collector IANA timezone name
    /// - APP_PIPELINE_ENABLED: Enable/disable the analysis pipeline (true/false)
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
                tracing::info!("Override server.port from env: {}", self.server.port);
            }
        }

        if let Ok(db_url) = std::env::var("APP_DATABASE_URL") {
            self.database.url = db_url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(max) = std::env::var("APP_MAX_BATCH_SIZE") {
            match max.parse() {
                Ok(val) => {
                    self.ingest.max_batch_size = val;
                    tracing::info!(
                        "Override ingest.max_batch_size from env: {}",
                        self.ingest.max_batch_size
                    );
                },
                Err(e) => tracing::warn!(
                    "Invalid APP_MAX_BATCH_SIZE '{}': {} (keep {})",
                    max,
                    e,
                    self.ingest.max_batch_size
                ),
            }
        }

        if let Ok(tz) = std::env::var("APP_COLLECTOR_TIMEZONE") {
            self.ingest.collector_timezone = tz;
            tracing::info!(
                "Override ingest.collector_timezone from env: {}",
                self.ingest.collector_timezone
            );
        }

        if let Ok(enabled) = std::env::var("APP_PIPELINE_ENABLED") {
            if let Ok(val) = enabled.parse() {
                self.pipeline.enabled = val;
                tracing::info!("Override pipeline.enabled from env: {}", self.pipeline.enabled);
            }
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(max) = args.max_batch_size {
            self.ingest.max_batch_size = max;
            tracing::info!("Override ingest.max_batch_size from CLI: {}", max);
        }

        if let Some(tz) = &args.collector_timezone {
            self.ingest.collector_timezone = tz.clone();
            tracing::info!("Override ingest.collector_timezone from CLI: {}", tz);
        }

        if let Some(enabled) = args.pipeline_enabled {
            self.pipeline.enabled = enabled;
            tracing::info!("Override pipeline.enabled from CLI: {}", enabled);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.ingest.max_batch_size == 0 {
            anyhow::bail!("ingest.max_batch_size must be > 0");
        }

        if self.ingest.collector_timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!(
                "ingest.collector_timezone '{}' is not a valid IANA timezone",
                self.ingest.collector_timezone
            );
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/syslens.db".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,syslens=debug".to_string(),
            file: Some("logs/syslens.log".to_string()),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { max_batch_size: 1000, collector_timezone: "UTC".to_string() }
    }
}

impl Default for PipelineBootConfig {
    fn default() -> Self {
        Self { enabled: true, maintenance_enabled: true }
    }
}
