//! Desired child objects of an Inference.
//!
//! Pure functions: given an Inference they build the Service, Deployment
//! and Job it should own. Nothing here talks to the cluster.

use std::collections::BTreeMap;

use cadence_api::{
    Inference, ServingSpec, INFERENCE_CONTAINER_PORT, INFERENCE_SERVICE_PORT,
    INFERENCE_SERVICE_PORT_NAME, OWNER_ANNOTATION,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use thiserror::Error;

/// Node selector key pinning pods to one host.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("inference has no uid yet")]
    MissingUid,

    #[error("inference declares no serving slots")]
    NoServings,

    #[error("serving slot {0} has neither an image nor a container template")]
    MissingImage(String),

    #[error("inference has no client job template")]
    MissingClientTemplate,

    #[error("client job template has no containers")]
    EmptyClientTemplate,

    #[error("assignment {name}={value} is not a resource quantity")]
    InvalidQuantity { name: String, value: String },
}

/// Values injected into every load job besides the Inference's own.
#[derive(Debug, Clone)]
pub struct JobEnvironment {
    /// Namespace the metrics server runs in.
    pub metrics_namespace: String,
    /// Port the metrics server listens on.
    pub metrics_port: String,
}

/// The three objects an Inference owns.
#[derive(Debug, Clone)]
pub struct ChildPlan {
    pub service: Service,
    pub deployment: Deployment,
    pub job: Job,
}

/// Plan every child of an Inference. Fails before anything is created if
/// any of the three cannot be built.
pub fn plan(inference: &Inference, env: &JobEnvironment) -> Result<ChildPlan, PlanError> {
    Ok(ChildPlan {
        service: plan_service(inference)?,
        deployment: plan_deployment(inference)?,
        job: plan_job(inference, env)?,
    })
}

fn child_meta(inference: &Inference, name: String) -> Result<ObjectMeta, PlanError> {
    let owner: OwnerReference = inference
        .controller_owner_ref(&())
        .ok_or(PlanError::MissingUid)?;
    let owner_value = format!(
        "{}/{}",
        inference.namespace().unwrap_or_default(),
        inference.name_any()
    );

    Ok(ObjectMeta {
        name: Some(name),
        namespace: inference.namespace(),
        labels: Some(inference.labels_for_children()),
        annotations: Some(BTreeMap::from([(OWNER_ANNOTATION.to_string(), owner_value)])),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

/// ClusterIP service in front of the serving pods.
pub fn plan_service(inference: &Inference) -> Result<Service, PlanError> {
    Ok(Service {
        metadata: child_meta(inference, inference.service_name())?,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(inference.selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some(INFERENCE_SERVICE_PORT_NAME.to_string()),
                port: INFERENCE_SERVICE_PORT,
                target_port: Some(IntOrString::Int(INFERENCE_CONTAINER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Replica count: the slot's own count for one slot, the sum otherwise.
fn replicas(servings: &[ServingSpec]) -> i32 {
    match servings {
        [single] => single.replicas.unwrap_or(1).max(1),
        many => many.iter().map(|s| s.replicas.unwrap_or(0)).sum::<i32>().max(1),
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn serving_containers(
    inference: &Inference,
    index: usize,
    slot: &ServingSpec,
) -> Result<Vec<Container>, PlanError> {
    let templated = slot
        .template
        .as_ref()
        .and_then(|t| t.spec.as_ref())
        .map(|s| s.containers.clone())
        .unwrap_or_default();
    if !templated.is_empty() {
        return Ok(templated
            .into_iter()
            .map(|mut c| {
                if let Some(image) = &slot.image {
                    c.image = Some(image.clone());
                }
                c
            })
            .collect());
    }

    let image = slot
        .image
        .clone()
        .ok_or_else(|| PlanError::MissingImage(slot.name.clone()))?;
    let name = match (slot.name.is_empty(), index) {
        (false, _) => slot.name.clone(),
        (true, 0) => inference.container_name(),
        (true, i) => format!("{}-{i}", inference.container_name()),
    };

    let mut vars = Vec::new();
    if let Some(path) = &slot.model_path {
        vars.push(env("MODEL_PATH", path.clone()));
    }
    if let Some(version) = &slot.model_version {
        vars.push(env("MODEL_VERSION", version.clone()));
    }
    if let Some(batch) = slot.batch_size {
        vars.push(env("BATCH_SIZE", batch.to_string()));
    }

    Ok(vec![Container {
        name,
        image: Some(image),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: INFERENCE_CONTAINER_PORT,
            ..Default::default()
        }]),
        env: (!vars.is_empty()).then_some(vars),
        ..Default::default()
    }])
}

/// Container resource an assignment name maps to, if any.
fn resource_name(assignment: &str) -> Option<&'static str> {
    match assignment.to_ascii_lowercase().as_str() {
        "cpu" => Some("cpu"),
        "memory" | "mem" => Some("memory"),
        _ => None,
    }
}

/// Whether `value` reads as a non-negative Kubernetes quantity such as
/// `500m`, `2`, `1.5Gi` or `1e3`.
fn is_quantity(value: &str) -> bool {
    let value = value.strip_prefix('+').unwrap_or(value);
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    if number.matches('.').count() > 1 || !number.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }

    match suffix {
        "" | "n" | "u" | "m" | "k" | "M" | "G" | "T" | "P" | "E" => true,
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => true,
        exponent => exponent
            .strip_prefix(['e', 'E'])
            .map(|e| e.strip_prefix(['+', '-']).unwrap_or(e))
            .is_some_and(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_digit())),
    }
}

/// Assignments named cpu or memory as container requests and limits.
///
/// Other assignments are tuning knobs for the load job and only reach it
/// through the environment.
fn assigned_resources(inference: &Inference) -> Result<BTreeMap<String, Quantity>, PlanError> {
    let mut resources = BTreeMap::new();
    for assignment in &inference.spec.assignments {
        let Some(resource) = resource_name(&assignment.name) else {
            continue;
        };
        let value = assignment.value.trim();
        if !is_quantity(value) {
            return Err(PlanError::InvalidQuantity {
                name: assignment.name.clone(),
                value: assignment.value.clone(),
            });
        }
        resources.insert(resource.to_string(), Quantity(value.to_string()));
    }
    Ok(resources)
}

fn apply_resources(container: &mut Container, resources: &BTreeMap<String, Quantity>) {
    if resources.is_empty() {
        return;
    }
    let requirements = container.resources.get_or_insert_with(ResourceRequirements::default);
    for (key, value) in resources {
        requirements
            .requests
            .get_or_insert_with(BTreeMap::new)
            .insert(key.clone(), value.clone());
        requirements
            .limits
            .get_or_insert_with(BTreeMap::new)
            .insert(key.clone(), value.clone());
    }
}

/// Serving deployment: one container per slot.
pub fn plan_deployment(inference: &Inference) -> Result<Deployment, PlanError> {
    let servings = &inference.spec.servings;
    if servings.is_empty() {
        return Err(PlanError::NoServings);
    }

    // Pod-level settings come from the first slot's template.
    let mut pod_spec = servings[0]
        .template
        .as_ref()
        .and_then(|t| t.spec.clone())
        .unwrap_or_default();

    let resources = assigned_resources(inference)?;
    let mut containers = Vec::new();
    for (index, slot) in servings.iter().enumerate() {
        for mut container in serving_containers(inference, index, slot)? {
            apply_resources(&mut container, &resources);
            containers.push(container);
        }
    }
    pod_spec.containers = containers;

    let mut node_selector = pod_spec.node_selector.take().unwrap_or_default();
    if let Some(extra) = &inference.spec.node_selector {
        node_selector.extend(extra.clone());
    }
    if let Some(node) = inference.spec.target_node.as_ref().filter(|n| !n.is_empty()) {
        node_selector.insert(HOSTNAME_LABEL.to_string(), node.clone());
    }
    pod_spec.node_selector = (!node_selector.is_empty()).then_some(node_selector);

    let selector = inference.selector_labels();
    let mut pod_labels = servings[0]
        .template
        .as_ref()
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    pod_labels.extend(selector.clone());

    Ok(Deployment {
        metadata: child_meta(inference, inference.deployment_name())?,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas(servings)),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            progress_deadline_seconds: inference.spec.progress_deadline_seconds,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Environment variable name for an assignment key.
pub fn assignment_env_name(key: &str) -> String {
    key.to_uppercase().replace('.', "_")
}

/// Load job: never restarted, never retried.
pub fn plan_job(inference: &Inference, environment: &JobEnvironment) -> Result<Job, PlanError> {
    let template = inference
        .spec
        .client_template
        .as_ref()
        .ok_or(PlanError::MissingClientTemplate)?;

    let mut spec: JobSpec = template.spec.clone().unwrap_or_default();
    spec.backoff_limit = Some(0);

    let pod_spec = spec.template.spec.get_or_insert_with(PodSpec::default);
    if pod_spec.containers.is_empty() {
        return Err(PlanError::EmptyClientTemplate);
    }
    pod_spec.restart_policy = Some("Never".to_string());

    let mut vars = vec![
        env(
            "RequestTemplate",
            inference.spec.request_template.clone().unwrap_or_default(),
        ),
        env("ServiceName", inference.endpoint()),
        env("InferenceName", inference.name_any()),
        env("Namespace", inference.namespace().unwrap_or_default()),
        env("DBNamespace", environment.metrics_namespace.clone()),
        env("DBPort", environment.metrics_port.clone()),
    ];
    vars.extend(
        inference
            .spec
            .assignments
            .iter()
            .map(|a| env(&assignment_env_name(&a.name), a.value.clone())),
    );

    for container in &mut pod_spec.containers {
        let existing = container.env.get_or_insert_with(Vec::new);
        existing.retain(|e| !vars.iter().any(|v| v.name == e.name));
        existing.extend(vars.iter().cloned());
    }

    let mut metadata = child_meta(inference, inference.job_name())?;
    if let Some(template_labels) = template.metadata.as_ref().and_then(|m| m.labels.clone()) {
        let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in template_labels {
            labels.entry(key).or_insert(value);
        }
    }

    Ok(Job {
        metadata,
        spec: Some(spec),
        ..Default::default()
    })
}
