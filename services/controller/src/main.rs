//! cadence controller
//!
//! Runs the Inference and SchedulingDecision controllers against the
//! cluster the process is configured for.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cadence_controller::{
    config::Config,
    inference::{self, InferenceEngine},
    planner::JobEnvironment,
    scheduling::{self, CampaignEngine, HttpSuggestionService, SchedulingClient},
    ControllerContext, ControllerRegistry, KubeCluster, CONTROLLER_NAME,
};
use cadence_metrics_store::{HttpBackend, PostgresBackend, StorageBackend, StoreConfig};
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

    info!("Starting cadence controller");
    info!(
        namespace = %config.namespace,
        scheduler_url = %config.scheduler_url,
        "Configuration loaded"
    );

    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client.clone(), CONTROLLER_NAME));

    let metrics: Arc<dyn StorageBackend> = match &config.database_url {
        Some(url) => {
            let backend = PostgresBackend::new(StoreConfig {
                database_url: url.clone(),
                window: config.metrics_window,
                query_timeout: config.rpc_timeout,
                ..StoreConfig::from_env()
            });
            if let Err(e) = backend.initialize().await {
                error!(error = %e, "Failed to initialize metrics database");
                return Err(e.into());
            }
            Arc::new(backend)
        }
        None => {
            let backend = HttpBackend::new(config.metrics_store_url(), config.rpc_timeout)?;
            if let Err(e) = backend.initialize().await {
                warn!(error = %e, url = %config.metrics_store_url(), "Metrics server not reachable yet");
            }
            Arc::new(backend)
        }
    };
    info!(backend = metrics.name(), "Metrics store ready");

    let inference_ctx = Arc::new(ControllerContext::new(
        InferenceEngine::new(
            cluster.clone(),
            metrics.clone(),
            JobEnvironment {
                metrics_namespace: config.namespace.clone(),
                metrics_port: config.metrics_store_port.to_string(),
            },
            config.default_metric_value.clone(),
        ),
        config.resync_interval,
    ));

    let suggestions = HttpSuggestionService::new(config.scheduler_url.clone(), config.rpc_timeout)?;
    let campaign_ctx = Arc::new(ControllerContext::new(
        CampaignEngine::new(cluster, SchedulingClient::new(suggestions)),
        config.resync_interval,
    ));

    let mut registry = ControllerRegistry::new();
    registry.register("Inference", {
        let client = client.clone();
        move |shutdown| inference::run(client, inference_ctx, shutdown)
    });
    registry.register("SchedulingDecision", move |shutdown| {
        scheduling::run(client, campaign_ctx, shutdown)
    });

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = registry.start_all(&shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    info!("Waiting for controllers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for (kind, handle) in handles {
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(kind, error = %e, "Controller task panicked"),
            Err(_) => warn!(kind, "Controller did not shut down in time"),
        }
    }

    if let Err(e) = metrics.close().await {
        warn!(error = %e, "Failed to close metrics store");
    }

    info!("Controller shutdown complete");
    Ok(())
}
