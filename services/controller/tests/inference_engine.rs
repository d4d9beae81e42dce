//! Inference convergence against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use cadence_api::{
    Inference, InferenceConditionType, InferenceSpec, InferenceStatus, MetricCategory,
    ServingSpec, KILL_ANNOTATION,
};
use cadence_controller::planner::JobEnvironment;
use cadence_controller::testing::{FakeCluster, JobOutcome, Verb};
use cadence_controller::{Error, InferenceEngine, Outcome};
use cadence_metrics_store::{MemoryBackend, SaveResult, StorageBackend};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Service};
use kube::api::ObjectMeta;

const NS: &str = "models";
const NAME: &str = "resnet";

struct Harness {
    cluster: Arc<FakeCluster>,
    metrics: Arc<MemoryBackend>,
    engine: InferenceEngine<FakeCluster>,
}

impl Harness {
    fn new() -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let metrics = Arc::new(MemoryBackend::new());
        let engine = InferenceEngine::new(
            cluster.clone(),
            metrics.clone(),
            JobEnvironment {
                metrics_namespace: "cadence-system".to_string(),
                metrics_port: "6799".to_string(),
            },
            "0.0",
        );
        Self {
            cluster,
            metrics,
            engine,
        }
    }

    async fn reconcile(&self) -> Result<Outcome, Error> {
        self.engine.reconcile(NS, NAME).await
    }

    fn inference(&self) -> Inference {
        self.cluster.object::<Inference>(NS, NAME).unwrap()
    }

    fn status(&self) -> InferenceStatus {
        self.inference().status.unwrap()
    }

    fn last_condition(&self) -> InferenceConditionType {
        self.status().conditions.last_type().unwrap()
    }

    fn children(&self) -> (usize, usize, usize) {
        (
            self.cluster.count::<Service>(NS),
            self.cluster.count::<Deployment>(NS),
            self.cluster.count::<Job>(NS),
        )
    }

    fn has_event(&self, reason: &str) -> bool {
        self.cluster.events().iter().any(|e| e.event.reason == reason)
    }

    /// Reconcile until the serving deployment exists, then mark it available.
    async fn until_available(&self) {
        self.reconcile().await.unwrap();
        self.reconcile().await.unwrap();
        self.cluster
            .set_deployment_state(NS, "resnet-deployment", true, false);
    }

    async fn until_job_running(&self) {
        self.until_available().await;
        self.reconcile().await.unwrap();
        assert_eq!(self.last_condition(), InferenceConditionType::Running);
    }
}

fn client_template() -> JobTemplateSpec {
    JobTemplateSpec {
        metadata: None,
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "client".to_string(),
                        image: Some("loadgen:1".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
    }
}

fn spec() -> InferenceSpec {
    InferenceSpec {
        servings: vec![ServingSpec {
            name: "resnet".to_string(),
            image: Some("resnet:1".to_string()),
            replicas: Some(1),
            ..Default::default()
        }],
        optional_nodes: vec!["node-a".to_string()],
        client_template: Some(client_template()),
        request_template: Some("{}".to_string()),
        ..Default::default()
    }
}

fn inference(spec: InferenceSpec) -> Inference {
    Inference {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

fn harness() -> Harness {
    let harness = Harness::new();
    harness.cluster.insert(inference(spec()));
    harness
}

#[tokio::test]
async fn missing_inference_is_not_found() {
    let harness = Harness::new();
    assert_eq!(harness.reconcile().await.unwrap(), Outcome::NotFound);
    assert!(harness.cluster.writes().is_empty());
}

#[tokio::test]
async fn first_reconcile_only_marks_created() {
    let harness = harness();

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Active);

    let status = harness.status();
    assert!(status.start_time.is_some());
    assert!(status.conditions.has(InferenceConditionType::Created));
    assert_eq!(harness.children(), (0, 0, 0));
    assert!(harness.has_event("Created"));

    let writes = harness.cluster.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].verb, Verb::UpdateStatus);
}

#[tokio::test]
async fn lost_status_race_is_corrected_by_next_reconcile() {
    let harness = harness();
    harness.cluster.conflict_next_status_write();

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Active);
    assert!(harness.inference().status.is_none());

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Active);
    assert!(harness.status().conditions.has(InferenceConditionType::Created));
    assert_eq!(harness.children(), (0, 0, 0));
}

#[tokio::test]
async fn unavailable_deployment_leaves_inference_pending() {
    let harness = harness();
    harness.reconcile().await.unwrap();
    harness.reconcile().await.unwrap();

    assert_eq!(harness.children(), (1, 1, 0));
    assert_eq!(harness.last_condition(), InferenceConditionType::Pending);

    let status = harness.status();
    assert_eq!(status.inference_endpoint.as_deref(), Some("resnet-service:8500"));
    assert_eq!(status.serving_statuses.len(), 1);
    assert_eq!(status.serving_statuses[0].name, "resnet");
}

#[tokio::test]
async fn converged_inference_causes_no_writes() {
    let harness = harness();
    harness.reconcile().await.unwrap();
    harness.reconcile().await.unwrap();

    harness.cluster.clear_writes();
    harness.reconcile().await.unwrap();
    assert!(harness.cluster.writes().is_empty());

    harness.cluster.set_deployment_state(NS, "resnet-deployment", true, false);
    harness.reconcile().await.unwrap();
    harness.cluster.clear_writes();
    harness.reconcile().await.unwrap();
    assert!(harness.cluster.writes().is_empty());
}

#[tokio::test]
async fn available_deployment_starts_the_job() {
    let harness = harness();
    harness.until_job_running().await;

    assert_eq!(harness.children(), (1, 1, 1));
    let job = harness
        .cluster
        .object::<Job>(NS, "resnet-client-job")
        .unwrap();
    assert_eq!(job.spec.unwrap().backoff_limit, Some(0));

    let status = harness.status();
    assert_eq!(status.serving_statuses[0].ready_replicas, 1);
}

#[tokio::test]
async fn failed_job_records_sentinel_metrics() {
    let harness = harness();
    harness.until_job_running().await;

    harness
        .cluster
        .set_job_outcome(NS, "resnet-client-job", JobOutcome::Failed);
    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);

    let status = harness.status();
    assert!(status.conditions.has(InferenceConditionType::Failed));
    assert!(!status.conditions.has(InferenceConditionType::Running));
    assert!(status.completion_time.is_some());

    let result = status.monitor_result.unwrap();
    assert_eq!(result.pod_metrics.len(), 3);
    assert_eq!(result.node_metrics.len(), 2);
    assert!(result.pod_metrics.iter().all(|m| m.value == "0.0"));
    assert!(result.node_metrics.iter().all(|m| m.node_name == "node-a"));

    assert_eq!(harness.children(), (0, 0, 0));
    assert!(harness.has_event("JobFailed"));
}

#[tokio::test]
async fn completed_job_with_metrics_succeeds() {
    let harness = harness();
    harness.until_job_running().await;

    harness
        .metrics
        .save(&SaveResult {
            namespace: NS.to_string(),
            inference_name: NAME.to_string(),
            node_name: None,
            key: "cpu".to_string(),
            value: "0.5".to_string(),
        })
        .await
        .unwrap();
    harness
        .cluster
        .set_job_outcome(NS, "resnet-client-job", JobOutcome::Complete);

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);

    let status = harness.status();
    assert_eq!(status.conditions.last_type(), Ok(InferenceConditionType::Succeeded));
    assert!(status.conditions.has(InferenceConditionType::Succeeded));
    assert_eq!(
        status.monitor_result.unwrap().pod_value(NAME, MetricCategory::Cpu),
        Some("0.5")
    );
    assert_eq!(harness.children(), (0, 0, 0));
    assert!(harness.has_event("JobSucceeded"));
}

#[tokio::test]
async fn completed_job_without_metrics_waits_for_them() {
    let harness = harness();
    harness.until_job_running().await;
    harness
        .cluster
        .set_job_outcome(NS, "resnet-client-job", JobOutcome::Complete);

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Active);
    let status = harness.status();
    let succeeded = status
        .conditions
        .get(InferenceConditionType::Succeeded)
        .unwrap();
    assert!(!succeeded.is_true());
    assert_eq!(succeeded.message, "Monitoring results are not available");
    assert_eq!(harness.children(), (1, 1, 1));

    harness
        .metrics
        .save(&SaveResult {
            namespace: NS.to_string(),
            inference_name: NAME.to_string(),
            node_name: None,
            key: "jct".to_string(),
            value: "12.5".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);
    assert!(harness.inference().is_succeeded());
}

#[tokio::test]
async fn terminal_inference_only_deletes() {
    let harness = Harness::new();
    let mut status = InferenceStatus::default();
    status.mark_created("created");
    status.mark_failed("failed earlier");
    harness.cluster.insert(Inference {
        status: Some(status),
        ..inference(spec())
    });
    harness.cluster.insert(Service {
        metadata: ObjectMeta {
            name: Some("resnet-service".to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        ..Default::default()
    });

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);
    assert_eq!(harness.children(), (0, 0, 0));

    let writes = harness.cluster.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].verb, Verb::Delete);
    assert_eq!(writes[0].kind, "Service");

    harness.cluster.clear_writes();
    harness.reconcile().await.unwrap();
    assert!(harness.cluster.writes().is_empty());
}

#[tokio::test]
async fn kill_request_tears_down_children() {
    let harness = harness();
    harness.until_available().await;
    assert_eq!(harness.children(), (1, 1, 0));

    harness.cluster.modify::<Inference>(NS, NAME, |inference| {
        inference.metadata.annotations = Some(BTreeMap::from([(
            KILL_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
    });

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);
    assert!(harness.inference().is_killed());
    assert!(harness.status().completion_time.is_some());
    assert_eq!(harness.children(), (0, 0, 0));
    assert!(harness.has_event("Killed"));
}

#[tokio::test]
async fn replica_failure_fails_the_inference() {
    let harness = harness();
    harness.reconcile().await.unwrap();
    harness.reconcile().await.unwrap();
    harness
        .cluster
        .set_deployment_state(NS, "resnet-deployment", false, true);

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);

    let status = harness.status();
    let failed = status.conditions.get(InferenceConditionType::Failed).unwrap();
    assert_eq!(failed.message, "Inference service pod failed");
    assert!(status.monitor_result.is_some());
    assert_eq!(harness.children(), (0, 0, 0));
}

#[tokio::test]
async fn unplannable_spec_fails_without_children() {
    let harness = Harness::new();
    harness.cluster.insert(inference(InferenceSpec {
        client_template: None,
        ..spec()
    }));

    harness.reconcile().await.unwrap();
    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);

    let failed = harness
        .status()
        .conditions
        .get(InferenceConditionType::Failed)
        .cloned()
        .unwrap();
    assert!(failed.message.starts_with("Invalid inference spec"));
    assert_eq!(harness.children(), (0, 0, 0));
    assert!(harness.has_event("InvalidSpec"));
}

#[tokio::test]
async fn create_failure_is_returned_without_status_write() {
    let harness = harness();
    harness.reconcile().await.unwrap();
    harness.cluster.reject_creates("Service");
    harness.cluster.clear_writes();

    let err = harness.reconcile().await.unwrap_err();
    assert!(matches!(err, Error::Cluster(_)));
    assert!(harness
        .cluster
        .writes()
        .iter()
        .all(|w| w.verb != Verb::UpdateStatus));
    assert!(harness.has_event("ReconcileFailed"));
}
