mod config;
mod mapper;
mod router;
mod transport;

#[cfg(test)]
mod test_broker;

use crate::config::Config;
use crate::mapper::Mapper;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok(); // Load environment variables from .env file

    let level = env::var("MAPPER_LOG_LEVEL")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::DEBUG);

    // Initialize logging
    tracing_subscriber::fmt().with_max_level(level).init();

    // Load configuration
    let config_path = env::var("MAPPER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Loaded {} rule(s) from {}", config.topics.len(), config_path.display());

    let rules = config.rule_set();
    let mapper = Mapper::new(rules, config.mqtt);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for termination signal: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    match mapper.run(shutdown).await {
        Ok(()) => {
            info!("Mapper shut down.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
