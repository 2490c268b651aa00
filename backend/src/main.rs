//! Media Downloader - a local download queue for yt-dlp with a web API
//!
//! Runs the queue and the HTTP/WebSocket server until SIGINT or SIGTERM,
//! then stops every tool process before exiting.

use anyhow::Result;
use media_downloader::config;
use media_downloader::db::{self, History};
use media_downloader::download::{DownloadExecutor, DownloadQueue, YtDlpInvocation};
use media_downloader::process::ProcessSupervisor;
use media_downloader::{server, AppState};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting Media Downloader v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = config::load_or_create_default()?;
    info!("Configuration loaded from {:?}", config::config_path());

    let tools = settings.tools.clone();
    let settings = Arc::new(RwLock::new(settings));

    // Initialize history
    let history = History::open_default()?;
    info!("History database initialized");

    let executor = DownloadExecutor::new(
        ProcessSupervisor::new(),
        Arc::new(YtDlpInvocation::new(tools)),
    );
    let queue = DownloadQueue::new(settings.clone(), executor);

    let recorder = db::spawn_recorder(history.clone(), queue.subscribe(), settings.clone());

    let state = Arc::new(
        AppState::new(settings.clone(), queue.clone(), history)
            .with_config_path(config::config_path()),
    );

    if let Err(e) = server::run(state, shutdown_signal()).await {
        error!("Server error: {}", e);
    }

    let grace = settings.read().downloads.stop_grace();
    info!("Stopping downloads");
    queue.shutdown(grace).await;

    recorder.abort();
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C on Windows)
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
