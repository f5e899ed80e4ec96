//! Care-gap evaluation core
//!
//! Quality-measure, care-gap rule and risk evaluation over versioned patient
//! contexts, a nightly batch scheduler and a real-time decision-support
//! adapter.

pub mod api;
pub mod cds;
pub mod clock;
pub mod core;
pub mod db;
pub mod error;
pub mod models;
pub mod scheduler;

/// Application configuration
pub mod config {
    use std::path::PathBuf;

    use serde::Deserialize;
    use url::Url;

    use crate::cds::CdsConfig;
    use crate::core::RiskModelConfig;
    use crate::scheduler::SchedulerConfig;

    #[derive(Debug, Clone, Deserialize)]
    pub struct Config {
        pub server: ServerConfig,
        pub logging: LoggingConfig,
        pub engine: EngineConfig,
        pub context: ContextConfig,
        pub scheduler: SchedulerConfig,
        pub insights: InsightsConfig,
        pub cds: CdsConfig,
        pub risk_model: RiskModelConfig,
        pub definitions: DefinitionsConfig,
        pub database: DatabaseConfig,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ServerConfig {
        pub host: String,
        pub port: u16,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct LoggingConfig {
        /// Default filter when `RUST_LOG` is unset.
        pub level: String,
        #[serde(default)]
        pub json: bool,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct EngineConfig {
        /// Oldest context a measure evaluation accepts.
        pub staleness_secs: i64,
        /// Reporting period length for batch measure jobs.
        pub period_months: u32,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ContextConfig {
        /// How long a cached context counts as warm for decision support.
        pub warm_ttl_secs: i64,
        /// Directory of `*.json` patient bundles served as the clinical source.
        pub bundles_dir: PathBuf,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct InsightsConfig {
        #[serde(default)]
        pub enabled: bool,
        pub endpoint: Option<Url>,
        pub model: String,
        #[serde(default)]
        pub api_key: Option<String>,
        pub timeout_ms: u64,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct DefinitionsConfig {
        pub dir: PathBuf,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct DatabaseConfig {
        /// SQLite url; results stay in memory when unset.
        #[serde(default)]
        pub url: Option<String>,
        pub max_connections: u32,
        /// Context versions kept per measure and patient; no pruning when unset.
        #[serde(default)]
        pub keep_versions: Option<usize>,
    }

    /// Load configuration from file
    pub fn load_config() -> Result<Config, config::ConfigError> {
        let env = std::env::var("CAREGAP_ENV").unwrap_or_else(|_| "development".into());

        config::Config::builder()
            // Start with default settings
            .add_source(config::File::with_name("config/default"))
            // Override with environment-specific settings
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            // Override with environment variables, e.g. CAREGAP_SCHEDULER__ABANDON_AFTER=3
            .add_source(config::Environment::with_prefix("CAREGAP").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Tracing subscriber setup
pub mod telemetry {
    use tracing_subscriber::{fmt, EnvFilter};

    use crate::config::LoggingConfig;

    /// Installs the global subscriber. `RUST_LOG` wins over the configured level.
    pub fn init(logging: &LoggingConfig) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
        let builder = fmt().with_env_filter(filter).with_target(true);
        let installed = if logging.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if let Err(e) = installed {
            eprintln!("tracing subscriber already installed: {}", e);
        }
    }
}
