//! The `Inference` custom resource.

use std::collections::BTreeMap;
use std::fmt;

use cadence_reconcile::ConditionLedger;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::metrics::MonitoringResult;
use crate::scheduling::ResourceAssignment;
use crate::{DEPLOYMENT_LABEL, INFERENCE_LABEL, INFERENCE_SERVICE_PORT, KILL_ANNOTATION};

/// One serving workload under evaluation.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cadence.io",
    version = "v1alpha1",
    kind = "Inference",
    plural = "inferences",
    shortname = "inf",
    status = "InferenceStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.inferenceEndpoint"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InferenceSpec {
    /// Workload domain, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,

    /// Serving slots; each becomes one container of the serving deployment.
    pub servings: Vec<ServingSpec>,

    /// Candidate nodes. Node-level default metrics are recorded for each.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_nodes: Vec<String>,

    /// Extra node selector for the serving pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Node the scheduling service placed this Inference on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,

    /// Resource values the scheduling service assigned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<ResourceAssignment>,

    /// Template of the load job that measures the serving workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_template: Option<JobTemplateSpec>,

    /// Request body the load job sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_template: Option<String>,

    /// Progress deadline of the serving deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Image,
    Timeseries,
}

/// One serving slot of an Inference.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServingSpec {
    #[serde(default)]
    pub name: String,

    /// Container image. Ignored when `template` carries its own container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i32>,

    /// Pod template fragment for this slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
pub enum InferenceConditionType {
    Created,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl fmt::Display for InferenceConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InferenceStatus {
    #[serde(default)]
    pub conditions: ConditionLedger<InferenceConditionType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_result: Option<MonitoringResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serving_statuses: Vec<ServingStatus>,

    /// In-cluster address of the inference service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_endpoint: Option<String>,
}

/// Replica counters observed for one serving slot.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServingStatus {
    pub name: String,
    pub replicas: i32,
    pub ready_replicas: i32,
}

impl InferenceStatus {
    pub fn mark_created(&mut self, message: &str) {
        self.conditions.set(InferenceConditionType::Created, true, message);
    }

    /// Closes a true `Running` first.
    pub fn mark_pending(&mut self, message: &str) {
        self.close_running();
        self.conditions.set(InferenceConditionType::Pending, true, message);
    }

    pub fn mark_running(&mut self, message: &str) {
        self.conditions.set(InferenceConditionType::Running, true, message);
    }

    /// `status == false` records a finished job whose results are not in yet.
    pub fn mark_succeeded(&mut self, status: bool, message: &str) {
        self.close_running();
        self.conditions.set(InferenceConditionType::Succeeded, status, message);
    }

    pub fn mark_failed(&mut self, message: &str) {
        self.close_running();
        self.conditions.set(InferenceConditionType::Failed, true, message);
    }

    pub fn mark_killed(&mut self, message: &str) {
        self.close_running();
        self.conditions.set(InferenceConditionType::Killed, true, message);
    }

    fn close_running(&mut self) {
        let running = self
            .conditions
            .get(InferenceConditionType::Running)
            .filter(|c| c.is_true())
            .map(|c| c.message.clone());
        if let Some(message) = running {
            self.conditions.set(InferenceConditionType::Running, false, message);
        }
    }
}

impl Inference {
    fn has_condition(&self, type_: InferenceConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.has(type_))
    }

    pub fn is_created(&self) -> bool {
        self.has_condition(InferenceConditionType::Created)
    }

    pub fn is_running(&self) -> bool {
        self.has_condition(InferenceConditionType::Running)
    }

    pub fn is_succeeded(&self) -> bool {
        self.has_condition(InferenceConditionType::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        self.has_condition(InferenceConditionType::Failed)
    }

    pub fn is_killed(&self) -> bool {
        self.has_condition(InferenceConditionType::Killed)
    }

    /// No child objects are created once this holds.
    pub fn is_terminal(&self) -> bool {
        self.is_succeeded() || self.is_failed() || self.is_killed()
    }

    pub fn kill_requested(&self) -> bool {
        self.annotations()
            .get(KILL_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn service_name(&self) -> String {
        format!("{}-service", self.name_any())
    }

    pub fn deployment_name(&self) -> String {
        format!("{}-deployment", self.name_any())
    }

    pub fn job_name(&self) -> String {
        format!("{}-client-job", self.name_any())
    }

    pub fn container_name(&self) -> String {
        format!("{}-container", self.name_any())
    }

    /// `<service>:<port>`, resolvable from inside the namespace.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.service_name(), INFERENCE_SERVICE_PORT)
    }

    /// Labels put on every child object.
    pub fn labels_for_children(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(INFERENCE_LABEL.to_string(), self.name_any())])
    }

    /// Labels selecting the serving pods.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels_for_children();
        labels.insert(DEPLOYMENT_LABEL.to_string(), self.deployment_name());
        labels
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    fn inference(name: &str) -> Inference {
        Inference {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: InferenceSpec::default(),
            status: Some(InferenceStatus::default()),
        }
    }

    #[test]
    fn test_child_names() {
        let inf = inference("resnet-1");
        assert_eq!(inf.service_name(), "resnet-1-service");
        assert_eq!(inf.deployment_name(), "resnet-1-deployment");
        assert_eq!(inf.job_name(), "resnet-1-client-job");
        assert_eq!(inf.endpoint(), "resnet-1-service:8500");

        let selector = inf.selector_labels();
        assert_eq!(selector.get("inference").map(String::as_str), Some("resnet-1"));
        assert_eq!(
            selector.get("deployment").map(String::as_str),
            Some("resnet-1-deployment")
        );
    }

    #[test]
    fn test_mark_succeeded_closes_running() {
        let mut status = InferenceStatus::default();
        status.mark_created("created");
        status.mark_running("job running");
        status.mark_succeeded(true, "done");

        let running = status.conditions.get(InferenceConditionType::Running).unwrap();
        assert!(!running.is_true());
        assert_eq!(running.message, "job running");
        assert_eq!(
            status.conditions.last_type(),
            Ok(InferenceConditionType::Succeeded)
        );
    }

    #[test]
    fn test_mark_pending_closes_running() {
        let mut status = InferenceStatus::default();
        status.mark_created("created");
        status.mark_pending("service not available");
        status.mark_running("job running");
        status.mark_pending("service not available");

        assert!(status.conditions.has(InferenceConditionType::Pending));
        assert!(!status.conditions.has(InferenceConditionType::Running));
        assert_eq!(
            status.conditions.last_type(),
            Ok(InferenceConditionType::Pending)
        );
    }

    #[test]
    fn test_mark_failed_without_running() {
        let mut status = InferenceStatus::default();
        status.mark_created("created");
        status.mark_failed("service pod failed");

        assert!(status.conditions.get(InferenceConditionType::Running).is_none());
        assert!(status.conditions.has(InferenceConditionType::Failed));
    }

    #[test]
    fn test_succeeded_false_is_not_terminal() {
        let mut inf = inference("a");
        let status = inf.status.as_mut().unwrap();
        status.mark_created("created");
        status.mark_succeeded(false, "results not available");

        assert!(!inf.is_terminal());
        assert!(!inf.is_running());
    }

    #[test]
    fn test_terminal_conditions() {
        let mut inf = inference("a");
        inf.status.as_mut().unwrap().mark_killed("killed");
        assert!(inf.is_terminal());
        assert!(inf.is_killed());
    }

    #[test]
    fn test_kill_requested() {
        let mut inf = inference("a");
        assert!(!inf.kill_requested());

        inf.metadata.annotations = Some(BTreeMap::from([(
            KILL_ANNOTATION.to_string(),
            "True".to_string(),
        )]));
        assert!(inf.kill_requested());
    }

    #[test]
    fn test_status_wire_format() {
        let mut status = InferenceStatus::default();
        status.mark_created("created");
        status.inference_endpoint = Some("a-service:8500".to_string());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["conditions"][0]["type"], "Created");
        assert_eq!(json["inferenceEndpoint"], "a-service:8500");
        assert!(json.get("monitorResult").is_none());
    }
}
