//! Storage for per-inference monitoring results.
//!
//! Load jobs write one row per observed metric; the Inference controller
//! reads them back once the job has finished and folds them into the
//! Inference status. Three backends implement [`StorageBackend`]:
//!
//! - [`PostgresBackend`]: the store of record, behind the metrics server
//! - [`HttpBackend`]: a client of the metrics server
//! - [`MemoryBackend`]: in-process, for tests and local runs
//!
//! # Contract
//!
//! - `save` is an upsert keyed by namespace, inference, node and metric key;
//!   repeated saves never accumulate duplicate rows
//! - `get` returns the most recent rows first, bounded by a window
//! - no rows is not an error; callers apply their own sentinel policy
//! - `initialize` and `close` are idempotent

mod config;
mod error;
mod http;
mod memory;
mod postgres;

use async_trait::async_trait;
use cadence_api::{MetricCategory, MonitoringResult, NodeMetric, PodMetric};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use config::StoreConfig;
pub use error::StorageError;
pub use http::HttpBackend;
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// One observation written by a load job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub namespace: String,
    pub inference_name: String,
    /// Set for node-level observations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub key: String,
    pub value: String,
}

impl SaveResult {
    pub(crate) fn validate(&self) -> Result<(), StorageError> {
        if self.namespace.is_empty() {
            return Err(StorageError::Invalid("namespace is empty".to_string()));
        }
        if self.inference_name.is_empty() {
            return Err(StorageError::Invalid("inference name is empty".to_string()));
        }
        if self.key.is_empty() {
            return Err(StorageError::Invalid("metric key is empty".to_string()));
        }
        Ok(())
    }

    /// Node name with the empty string standing in for "no node".
    pub(crate) fn node_key(&self) -> &str {
        self.node_name.as_deref().unwrap_or_default()
    }
}

/// One stored observation, as returned by `get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub key: String,
    pub value: String,
}

/// Reply to a `GetResult` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResultReply {
    pub namespace: String,
    pub inference_name: String,
    pub results: Vec<ResultRow>,
}

/// Read/write contract every metrics backend implements.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Connect and make sure the schema exists. Safe to call repeatedly.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Release the connection. Safe to call repeatedly.
    async fn close(&self) -> Result<(), StorageError>;

    fn name(&self) -> &'static str;

    /// Insert or update one observation.
    async fn save(&self, result: &SaveResult) -> Result<(), StorageError>;

    /// Most recent observations for an inference, newest first.
    async fn get(
        &self,
        namespace: &str,
        inference_name: &str,
    ) -> Result<Vec<ResultRow>, StorageError>;
}

/// Fold stored rows into a monitoring result.
///
/// Rows without a node become pod metrics for `inference_name`; rows with a
/// node become node metrics. Rows are expected newest first: the first row
/// seen for a subject and category wins. Keys outside the category
/// vocabulary are dropped.
pub fn monitoring_result(inference_name: &str, rows: &[ResultRow]) -> MonitoringResult {
    let mut result = MonitoringResult::default();

    for row in rows {
        let category = match row.key.parse::<MetricCategory>() {
            Ok(category) => category,
            Err(e) => {
                warn!(inference = %inference_name, key = %row.key, error = %e, "Dropping metric row");
                continue;
            }
        };

        match row.node_name.as_deref().filter(|n| !n.is_empty()) {
            None => {
                if result.pod_value(inference_name, category).is_none() {
                    result.pod_metrics.push(PodMetric {
                        pod_name: inference_name.to_string(),
                        category,
                        value: row.value.clone(),
                    });
                }
            }
            Some(node) => {
                let seen = result
                    .node_metrics
                    .iter()
                    .any(|m| m.node_name == node && m.category == category);
                if !seen {
                    result.node_metrics.push(NodeMetric {
                        node_name: node.to_string(),
                        category,
                        value: row.value.clone(),
                    });
                }
            }
        }
    }

    result
}
