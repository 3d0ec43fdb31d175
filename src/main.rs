//! llama-embed-manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use llama_embed_manager::{
    ModelRegistry, ServerManager, api, config::ManagerConfig, gpu::GpuInfo, metrics,
    models::ScanSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "llama-embed-manager")]
#[command(about = "On-demand llama-server manager with an OpenAI-compatible API", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API listen address
    #[arg(long)]
    host: Option<String>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Override models directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting llama-embed-manager");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(models_dir) = cli.models_dir {
        config.models_dir = models_dir;
    }

    config.validate()?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        models_dir = %config.models_dir.display(),
        unload_timeout_secs = config.unload_timeout_secs,
        "Configuration loaded"
    );

    let catalog = ModelRegistry::scan(&config.models_dir, &ScanSettings::from(&config))?;
    if catalog.is_empty() {
        tracing::warn!(
            models_dir = %config.models_dir.display(),
            "No models found; API will serve an empty catalog"
        );
    }
    config.validate_model_ports(catalog.ports())?;

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let gpu = Arc::new(GpuInfo::detect(&config.server_env));
    let manager = ServerManager::from_config(&config, catalog)?;

    // Setup API
    let app_state = api::AppState {
        manager: manager.clone(),
        gpu,
        failure_policy: config.embedding_failure_policy,
        fallback_dimensions: config.fallback_embedding_dimensions,
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    let report = manager.shutdown().await;
    for (model, reason) in &report.failures {
        tracing::error!(model = %model, error = %reason, "Failed to stop server during shutdown");
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
