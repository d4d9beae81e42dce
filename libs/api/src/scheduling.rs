//! The `SchedulingDecision` custom resource: a campaign of Inferences.

use std::fmt;

use cadence_reconcile::ConditionLedger;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::inference::InferenceSpec;
use crate::metrics::{MetricCategory, MonitoringResult};

/// Parallelism used when a campaign does not set one.
pub const DEFAULT_PARALLELISM: i32 = 1;

/// A bounded series of Inferences placed by an external algorithm.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cadence.io",
    version = "v1alpha1",
    kind = "SchedulingDecision",
    plural = "schedulingdecisions",
    shortname = "sd",
    status = "SchedulingDecisionStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.inferencesTotal"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingDecisionSpec {
    pub algorithm: AlgorithmSpec,

    /// Upper bound on Inferences ever created by this campaign.
    pub max_num_inferences: i32,

    /// Upper bound on Inferences active at the same time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<Objective>,

    /// Forwarded to every Inference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_template: Option<String>,

    /// Forwarded to every Inference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_template: Option<JobTemplateSpec>,

    /// Template stamped out for each Inference.
    pub inference_template: InferenceSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmSpec {
    pub algorithm_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub algorithm_settings: Vec<AlgorithmSetting>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct AlgorithmSetting {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Objective {
    #[serde(rename = "type")]
    pub type_: ObjectiveType,
    /// Metric category the algorithm optimizes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricCategory>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveType {
    Maximize,
    Minimize,
}

/// A resource value assigned to one Inference.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct ResourceAssignment {
    pub name: String,
    pub value: String,
    pub category: MetricCategory,
}

/// Placement the scheduling service returned for one Inference.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingResult {
    pub target_inference_name: String,
    #[serde(default)]
    pub target_node: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_assignments: Vec<ResourceAssignment>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
pub enum SchedulingConditionType {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for SchedulingConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingDecisionStatus {
    #[serde(default)]
    pub conditions: ConditionLedger<SchedulingConditionType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub running_inference_list: Vec<String>,
    #[serde(default)]
    pub pending_inference_list: Vec<String>,
    #[serde(default)]
    pub succeeded_inference_list: Vec<String>,
    #[serde(default)]
    pub failed_inference_list: Vec<String>,
    #[serde(default)]
    pub killed_inference_list: Vec<String>,

    #[serde(default)]
    pub inferences_total: i32,
    #[serde(default)]
    pub inferences_running: i32,
    #[serde(default)]
    pub inferences_pending: i32,
    #[serde(default)]
    pub inferences_succeeded: i32,
    #[serde(default)]
    pub inferences_failed: i32,
    #[serde(default)]
    pub inferences_killed: i32,

    /// Monitoring results of the succeeded Inferences.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub current_monitoring: Vec<MonitoringResult>,

    /// Placement applied to every Inference of the campaign.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduling_results: Vec<SchedulingResult>,
}

impl SchedulingDecisionStatus {
    pub fn mark_created(&mut self, message: &str) {
        self.conditions.set(SchedulingConditionType::Created, true, message);
    }

    pub fn mark_running(&mut self, message: &str) {
        self.conditions.set(SchedulingConditionType::Running, true, message);
    }

    pub fn mark_succeeded(&mut self, message: &str) {
        let running = self
            .conditions
            .get(SchedulingConditionType::Running)
            .filter(|c| c.is_true())
            .map(|c| c.message.clone());
        if let Some(running) = running {
            self.conditions.set(SchedulingConditionType::Running, false, running);
        }
        self.conditions.set(SchedulingConditionType::Succeeded, true, message);
    }

    /// Inferences that still occupy a parallelism slot.
    pub fn active(&self) -> i32 {
        self.inferences_running + self.inferences_pending
    }
}

impl SchedulingDecision {
    pub fn parallelism(&self) -> i32 {
        self.spec.parallelism.unwrap_or(DEFAULT_PARALLELISM)
    }

    pub fn is_maximize(&self) -> bool {
        self.spec
            .objective
            .as_ref()
            .is_some_and(|o| o.type_ == ObjectiveType::Maximize)
    }

    pub fn is_created(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.has(SchedulingConditionType::Created))
    }

    pub fn is_completed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.has(SchedulingConditionType::Succeeded))
    }
}
