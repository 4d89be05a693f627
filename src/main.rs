// src/main.rs

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod server;
mod sys;

use crate::config::{LogFormat, RelayConfig};
use crate::server::RelayService;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment
    // ==============================================================================

    let config = RelayConfig::load().map_err(|e| format!("Invalid configuration: {}", e))?;
    init_tracing(config.log_format);

    // ==============================================================================
    // 2. Filesystem Layout
    // ==============================================================================

    // 🛡️ The work root holds per-job key material: rwx------ for the service user only.
    RelayService::prepare_filesystem(&config).await?;

    // ==============================================================================
    // 3. Service Start
    // ==============================================================================

    let bind_addr = config.bind_addr;
    tracing::info!(
        work_root = %config.work_root.display(),
        logs_dir = %config.logs_dir.display(),
        playbook = %config.playbook_path.display(),
        timeout_secs = config.job_timeout.map(|t| t.as_secs()),
        "Provision relay configured"
    );

    let app = server::router(Arc::new(RelayService::new(config)));
    let listener = TcpListener::bind(bind_addr).await?;

    tracing::info!("⚙️ Provision relay listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
