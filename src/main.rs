//! tlsgate: single-domain TLS terminating reverse proxy.
//!
//! This is the process entry point. It parses the command line, initializes
//! tracing, loads and validates the configuration and runs both listeners until
//! a termination signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tlsgate::config::{AppConfig, ConfigError, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use tlsgate::http::start_server;

/// tlsgate: HTTPS for one domain in front of a plain-HTTP backend
#[derive(Parser, Debug)]
#[command(name = "tlsgate", version, about)]
struct Args {
    /// Path to configuration file (optional when the default path does not exist)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Domain to serve and obtain a certificate for
    #[arg(short, long, env = "TLSGATE_DOMAIN")]
    domain: Option<String>,

    /// Backend address as host:port
    #[arg(short, long, env = "TLSGATE_BACKEND")]
    backend: Option<String>,

    /// Directory for certificates and the ACME account
    #[arg(long, env = "TLSGATE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Log level filter (e.g., "tlsgate=debug,axum_server=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file (if any) and apply command-line overrides.
    fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
                AppConfig::load(DEFAULT_CONFIG_PATH)?
            }
            None => AppConfig::default(),
        };

        if let Some(domain) = &self.domain {
            config.domain = Some(domain.clone());
        }
        if let Some(backend) = &self.backend {
            config.backend = backend.clone();
        }
        if let Some(cache_dir) = &self.cache_dir {
            config.acme.cache_dir = cache_dir.clone();
        }
        Ok(config)
    }
}

fn init_tracing(filter: &str, json: bool) {
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(filter));
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: CLI > env > default
    let log_filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&log_filter, false);
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&log_filter, config.logging.is_json());

    let validated = match config.validate() {
        Ok(validated) => validated,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match start_server(&config, validated).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "tlsgate stopped with an error");
            ExitCode::FAILURE
        }
    }
}
