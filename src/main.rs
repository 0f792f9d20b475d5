use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod ai;
mod budget;
mod cache;
mod config;
mod connectors;
mod db;
mod llm;
mod query;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::db::AppDb;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging
    init_tracing(args.log_json);

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Ensure data directory exists; CSV connections are ingested here
    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    let pool_size = u32::try_from(config.database.pool_size).unwrap_or(u32::MAX);
    let db = AppDb::open(&config.database.connection_string, pool_size)?;

    info!("Initializing LLM provider with backend: {}", config.llm.backend);
    let provider = llm::create_provider(&config.llm)?;

    let cache = cache::create_cache(&config.cache).await;

    let web_config = config.web.clone();
    let app_state = Arc::new(AppState::new(config, db, provider, cache, data_dir));

    // Start the web server
    info!("Starting DataMind server on {}:{}", web_config.host, web_config.port);
    match web::run_server(web_config, app_state).await {
        Ok(()) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
