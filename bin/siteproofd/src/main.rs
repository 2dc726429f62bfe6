//! `siteproofd` — the analysis scheduler server binary.
//!
//! Usage:
//!   siteproofd [-c <config.toml>] [--listen <addr>] [--data-dir <path>]
//!
//! Serves the producer and worker APIs of the processing module and
//! runs the background lease sweep. Task handlers run in external
//! worker processes that talk to the worker API with their token.

mod bootstrap;
mod config;
mod routes;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use siteproof_core::Module;
use siteproof_processing::ProcessingModule;
use siteproof_processing::sweep::SweepConfig;

use config::ServerConfig;

/// Siteproof scheduler server.
#[derive(Parser, Debug)]
#[command(name = "siteproofd", about = "Siteproof analysis scheduler")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short = 'c', long = "config")]
    config: Option<std::path::PathBuf>,

    /// Listen address.
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Override the configured data directory.
    #[arg(long = "data-dir")]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load server configuration.
    let mut server_config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ServerConfig::load(path)?
        }
        None => ServerConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        server_config.storage.data_dir = data_dir;
    }
    bootstrap::verify_config(&server_config)?;

    // Initialize storage.
    let data_dir = server_config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let core_config = siteproof_core::ServiceConfig {
        data_dir: Some(data_dir.clone()),
        listen: cli.listen.clone(),
        ..Default::default()
    };

    let sql: Arc<dyn siteproof_sql::SqlStore> = Arc::new(
        siteproof_sql::SqliteStore::open(&core_config.resolve_sqlite_path())
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {e}"))?,
    );

    // Processing module: task store, claim engine, lease sweep.
    let processing_module = ProcessingModule::with_config(
        Arc::clone(&sql),
        SweepConfig {
            interval_secs: server_config.sweep.interval_secs,
        },
    )?;
    info!("Processing module initialized");

    // Ensure the default worker exists when a bootstrap token is set.
    bootstrap::ensure_bootstrap_worker(processing_module.engine().store(), &server_config)?;

    let module_routes = vec![(processing_module.name(), processing_module.routes())];

    // Build router.
    let app = routes::build_router(module_routes);

    // Start server.
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!("siteproofd listening on {}", cli.listen);
    axum::serve(listener, app).await?;

    Ok(())
}
