use std::net::SocketAddr;

use anyhow::Result;
use cadence_metrics_store::StoreConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub store: StoreConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CADENCE_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:6799".to_string())
            .parse()?;

        let log_level = std::env::var("CADENCE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            log_level,
            store: StoreConfig::from_env(),
        })
    }
}
