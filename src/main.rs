mod compose;
mod config;
mod engine;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod store;

use crate::compose::deployer::ComposeCli;
use crate::config::AppConfig;
use crate::engine::DockerEngine;
use crate::services::queue::JobQueue;
use crate::services::scheduler::BackupScheduler;
use crate::state::AppState;
use crate::store::Store;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting stackvault on port {}", config.port);

    // Ensure data directories exist
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.backups_dir)?;

    // Connect to the container engine
    let docker = DockerEngine::connect()?;
    if let Err(e) = docker.ping().await {
        tracing::warn!("Engine not reachable yet: {e}. Is the daemon running?");
    }

    // Load persisted state
    let store = Store::open(&config.data_dir).await?;

    // Build application state
    let (jobs, worker) = JobQueue::new();
    let scheduler = Arc::new(BackupScheduler::new().await?);
    let state = Arc::new(AppState {
        config: config.clone(),
        engine: Arc::new(docker),
        deployer: Arc::new(ComposeCli),
        store,
        jobs,
        scheduler: scheduler.clone(),
    });

    // Start the single job worker
    worker.spawn(state.clone());

    // Initialize cron schedules
    if let Err(e) = scheduler.init_schedules(&state).await {
        tracing::warn!("Failed to initialize schedules: {}", e);
    }
    if let Err(e) = scheduler.start().await {
        tracing::warn!("Failed to start scheduler: {}", e);
    }

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let cancel = CancellationToken::new();
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
