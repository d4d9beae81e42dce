//! cadence metrics server
//!
//! Serves `SaveResult`/`GetResult` over HTTP on top of the Postgres store.

use std::sync::Arc;

use anyhow::Result;
use cadence_metrics_server::{api, config::Config, state::AppState};
use cadence_metrics_store::{PostgresBackend, StorageBackend};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CADENCE_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cadence metrics server");
    info!(listen_addr = %config.listen_addr, window = config.store.window, "Configuration loaded");

    let backend: Arc<dyn StorageBackend> = Arc::new(PostgresBackend::new(config.store.clone()));
    let state = AppState::new(backend.clone());

    // The database may come up after us; serve liveness meanwhile.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let init_handle = tokio::spawn({
        let state = state.clone();
        let backend = backend.clone();
        async move {
            match backend.initialize().await {
                Ok(()) => {
                    state.mark_ready();
                    info!("Metrics store ready");
                    true
                }
                Err(e) => {
                    error!(error = %e, "Failed to initialize metrics store");
                    false
                }
            }
        }
    });

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = init_handle => {
            if !matches!(result, Ok(true)) {
                let _ = shutdown_tx.send(true);
                anyhow::bail!("metrics store could not be initialized");
            }
            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(std::time::Duration::from_secs(10), server_handle).await {
        Ok(Ok(Ok(()))) => info!("Server exited normally"),
        Ok(Ok(Err(e))) => error!(error = %e, "Server error"),
        Ok(Err(e)) => error!(error = %e, "Server task panicked"),
        Err(_) => warn!("Server did not shut down in time"),
    }

    if let Err(e) = backend.close().await {
        warn!(error = %e, "Failed to close metrics store");
    }

    info!("Metrics server shutdown complete");
    Ok(())
}
