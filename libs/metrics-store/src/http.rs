//! Client of the metrics server.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::{GetResultReply, ResultRow, SaveResult, StorageBackend, StorageError};

/// Metrics backend that talks to the metrics server over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Metrics server request failed");
        Err(StorageError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl StorageBackend for HttpBackend {
    async fn initialize(&self) -> Result<(), StorageError> {
        let url = format!("{}/healthz", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }

    async fn save(&self, result: &SaveResult) -> Result<(), StorageError> {
        result.validate()?;
        let url = format!("{}/v1/results", self.base_url);
        debug!(
            inference = %result.inference_name,
            key = %result.key,
            "Posting monitoring result"
        );

        let response = self.client.post(&url).json(result).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get(
        &self,
        namespace: &str,
        inference_name: &str,
    ) -> Result<Vec<ResultRow>, StorageError> {
        let url = format!("{}/v1/results/{}/{}", self.base_url, namespace, inference_name);
        debug!(url = %url, "Fetching monitoring results");

        let response = self.client.get(&url).send().await?;
        let reply: GetResultReply = Self::check(response).await?.json().await?;
        Ok(reply.results)
    }
}
