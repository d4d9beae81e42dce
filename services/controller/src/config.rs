use std::time::Duration;

use anyhow::Result;
use cadence_api::DEFAULT_METRIC_VALUE;
use cadence_reconcile::DEFAULT_RESYNC_INTERVAL;

/// Port the metrics server listens on.
pub const DEFAULT_METRICS_STORE_PORT: u16 = 6799;

/// Port of the scheduling service.
pub const DEFAULT_SCHEDULER_PORT: u16 = 9996;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Namespace the controller and its services run in.
    pub namespace: String,
    pub scheduler_url: String,
    pub metrics_store_service: String,
    pub metrics_store_port: u16,
    /// When set, metrics are read straight from Postgres. The remaining
    /// connection settings come from the metrics store's own environment.
    pub database_url: Option<String>,
    pub default_metric_value: String,
    /// Ceiling for scheduling-service and metrics-store calls.
    pub rpc_timeout: Duration,
    pub resync_interval: Duration,
    pub metrics_window: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = env_or("CADENCE_LOG_LEVEL", "info");
        let namespace = env_or("CADENCE_NAMESPACE", "cadence-system");

        let scheduler_url = std::env::var("CADENCE_SCHEDULER_URL").unwrap_or_else(|_| {
            format!("http://cadence-algorithm-server.{namespace}:{DEFAULT_SCHEDULER_PORT}")
        });

        let metrics_store_service = env_or("CADENCE_METRICS_STORE_SERVICE", "cadence-metrics-server");
        let metrics_store_port = match std::env::var("CADENCE_METRICS_STORE_PORT") {
            Ok(port) => port.parse()?,
            Err(_) => DEFAULT_METRICS_STORE_PORT,
        };

        let database_url = std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty());
        let default_metric_value = env_or("CADENCE_DEFAULT_METRIC_VALUE", DEFAULT_METRIC_VALUE);

        let rpc_timeout = Duration::from_secs(env_parse("CADENCE_RPC_TIMEOUT_SECS", 60)?);
        let resync_interval = match std::env::var("CADENCE_RESYNC_SECS") {
            Ok(secs) => Duration::from_secs(secs.parse()?),
            Err(_) => DEFAULT_RESYNC_INTERVAL,
        };
        let metrics_window = env_parse("CADENCE_METRICS_WINDOW", 50)?;

        Ok(Self {
            log_level,
            namespace,
            scheduler_url,
            metrics_store_service,
            metrics_store_port,
            database_url,
            default_metric_value,
            rpc_timeout,
            resync_interval,
            metrics_window,
        })
    }

    /// In-cluster URL of the metrics server.
    pub fn metrics_store_url(&self) -> String {
        format!(
            "http://{}.{}:{}",
            self.metrics_store_service, self.namespace, self.metrics_store_port
        )
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T>(key: &str, fallback: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(fallback),
    }
}
