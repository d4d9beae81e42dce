//! Client of the external scheduling service.
//!
//! The service decides where each new Inference of a campaign runs and
//! what resources it gets. A call either yields exactly the requested
//! number of placements or fails as a whole.

use std::time::Duration;

use async_trait::async_trait;
use cadence_api::{
    Inference, MetricCategory, ResourceAssignment, SchedulingDecision, SchedulingResult,
};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum SchedulingError {
    /// Rejected before any call was made.
    #[error("invalid suggestion request: {0}")]
    InvalidRequest(String),

    #[error("scheduling service returned {returned} decisions, {requested} were requested")]
    CardinalityMismatch { requested: i32, returned: usize },

    #[error("scheduling service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("scheduling service answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Placement and metrics of an Inference that already finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingResult {
    pub inference_name: String,
    #[serde(default)]
    pub target_node: String,
    #[serde(default)]
    pub resource_assignments: Vec<KeyValue>,
    #[serde(default)]
    pub metrics: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRequest {
    pub algorithm_name: String,
    #[serde(default)]
    pub algorithm_settings: Vec<KeyValue>,
    pub required_count: i32,
    pub is_first_request: bool,
    pub is_maximize: bool,
    #[serde(default)]
    pub existing_results_summary: Vec<ExistingResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    #[serde(default)]
    pub target_instance_name: String,
    #[serde(default)]
    pub target_node: String,
    #[serde(default)]
    pub resource_assignments: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionResponse {
    #[serde(default)]
    pub decisions: Vec<Decision>,
}

/// Transport to the scheduling service.
#[async_trait]
pub trait SuggestionService: Send + Sync + 'static {
    async fn get_suggestions(
        &self,
        request: &SuggestionRequest,
    ) -> Result<SuggestionResponse, SchedulingError>;
}

/// [`SuggestionService`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpSuggestionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSuggestionService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SchedulingError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SuggestionService for HttpSuggestionService {
    async fn get_suggestions(
        &self,
        request: &SuggestionRequest,
    ) -> Result<SuggestionResponse, SchedulingError> {
        let response = self
            .client
            .post(format!("{}/v1/suggestions", self.base_url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

/// Category of an assignment key. Only memory is told apart; everything
/// else is treated as cpu.
pub fn classify_assignment(key: &str) -> MetricCategory {
    if key.eq_ignore_ascii_case("memory") || key.eq_ignore_ascii_case("mem") {
        MetricCategory::Memory
    } else {
        MetricCategory::Cpu
    }
}

fn existing_result(inference: &Inference) -> ExistingResult {
    let metrics = inference
        .status
        .as_ref()
        .and_then(|s| s.monitor_result.as_ref())
        .map(|r| {
            r.pod_metrics
                .iter()
                .map(|m| KeyValue {
                    key: m.category.as_str().to_string(),
                    value: m.value.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    ExistingResult {
        inference_name: inference.name_any(),
        target_node: inference.spec.target_node.clone().unwrap_or_default(),
        resource_assignments: inference
            .spec
            .assignments
            .iter()
            .map(|a| KeyValue {
                key: a.name.clone(),
                value: a.value.clone(),
            })
            .collect(),
        metrics,
    }
}

/// Validating front of a [`SuggestionService`].
pub struct SchedulingClient<S> {
    service: S,
}

impl<S: SuggestionService> SchedulingClient<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Ask for `count` placements for `campaign`, which already created
    /// `current_total` Inferences. `existing` feeds the results summary;
    /// only succeeded Inferences are reported.
    #[instrument(skip(self, campaign, existing), fields(campaign = %campaign.name_any()))]
    pub async fn request_suggestions(
        &self,
        count: i32,
        campaign: &SchedulingDecision,
        current_total: i32,
        existing: &[Inference],
    ) -> Result<Vec<SchedulingResult>, SchedulingError> {
        if count <= 0 {
            return Err(SchedulingError::InvalidRequest(format!(
                "requested count must be positive, got {count}"
            )));
        }
        let max = campaign.spec.max_num_inferences;
        if current_total + count > max {
            return Err(SchedulingError::InvalidRequest(format!(
                "{current_total} existing plus {count} requested exceeds the maximum of {max}"
            )));
        }
        let parallelism = campaign.parallelism();
        if count > parallelism {
            return Err(SchedulingError::InvalidRequest(format!(
                "requested count {count} exceeds parallelism {parallelism}"
            )));
        }

        let request = SuggestionRequest {
            algorithm_name: campaign.spec.algorithm.algorithm_name.clone(),
            algorithm_settings: campaign
                .spec
                .algorithm
                .algorithm_settings
                .iter()
                .map(|s| KeyValue {
                    key: s.name.clone(),
                    value: s.value.clone(),
                })
                .collect(),
            required_count: count,
            is_first_request: current_total < 1,
            is_maximize: campaign.is_maximize(),
            existing_results_summary: existing
                .iter()
                .filter(|i| i.is_succeeded())
                .map(existing_result)
                .collect(),
        };

        debug!(count, current_total, "Requesting suggestions");
        let response = self.service.get_suggestions(&request).await?;

        if response.decisions.len() != count as usize {
            return Err(SchedulingError::CardinalityMismatch {
                requested: count,
                returned: response.decisions.len(),
            });
        }

        Ok(response
            .decisions
            .into_iter()
            .map(|decision| SchedulingResult {
                target_inference_name: decision.target_instance_name,
                target_node: decision.target_node,
                resource_assignments: decision
                    .resource_assignments
                    .into_iter()
                    .map(|kv| ResourceAssignment {
                        category: classify_assignment(&kv.key),
                        name: kv.key,
                        value: kv.value,
                    })
                    .collect(),
            })
            .collect())
    }
}
