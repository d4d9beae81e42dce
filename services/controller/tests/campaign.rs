//! SchedulingDecision campaigns against the in-memory cluster.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cadence_api::{
    AlgorithmSpec, Inference, InferenceSpec, MonitoringResult, SchedulingConditionType,
    SchedulingDecision, SchedulingDecisionSpec, SchedulingDecisionStatus, ServingSpec,
    CAMPAIGN_LABEL,
};
use cadence_controller::scheduling::{
    Decision, KeyValue, SchedulingClient, SchedulingError, SuggestionRequest, SuggestionResponse,
    SuggestionService,
};
use cadence_controller::testing::{FakeCluster, Verb};
use cadence_controller::{CampaignEngine, Error, Outcome};
use kube::api::ObjectMeta;
use kube::ResourceExt;

const NS: &str = "models";
const NAME: &str = "sweep";

/// Returns `short` decisions fewer than requested.
#[derive(Clone)]
struct StubService {
    short: usize,
    calls: Arc<AtomicUsize>,
    issued: Arc<AtomicUsize>,
}

#[async_trait]
impl SuggestionService for StubService {
    async fn get_suggestions(
        &self,
        request: &SuggestionRequest,
    ) -> Result<SuggestionResponse, SchedulingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let count = (request.required_count as usize).saturating_sub(self.short);
        Ok(SuggestionResponse {
            decisions: (0..count)
                .map(|_| {
                    let n = self.issued.fetch_add(1, Ordering::SeqCst);
                    Decision {
                        target_instance_name: format!("{NAME}-{n}"),
                        target_node: "node-a".to_string(),
                        resource_assignments: vec![KeyValue {
                            key: "cpu".to_string(),
                            value: "500m".to_string(),
                        }],
                    }
                })
                .collect(),
        })
    }
}

struct Harness {
    cluster: Arc<FakeCluster>,
    calls: Arc<AtomicUsize>,
    engine: CampaignEngine<FakeCluster, StubService>,
}

impl Harness {
    fn new(max: i32, parallelism: i32, short: usize) -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let service = StubService {
            short,
            calls: Arc::new(AtomicUsize::new(0)),
            issued: Arc::new(AtomicUsize::new(0)),
        };
        let calls = service.calls.clone();
        cluster.insert(SchedulingDecision {
            metadata: ObjectMeta {
                name: Some(NAME.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: SchedulingDecisionSpec {
                algorithm: AlgorithmSpec {
                    algorithm_name: "random".to_string(),
                    algorithm_settings: vec![],
                },
                max_num_inferences: max,
                parallelism: Some(parallelism),
                request_template: Some("{\"instances\": []}".to_string()),
                inference_template: InferenceSpec {
                    servings: vec![ServingSpec {
                        name: "model".to_string(),
                        image: Some("model:1".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        });
        let engine = CampaignEngine::new(cluster.clone(), SchedulingClient::new(service));
        Self {
            cluster,
            calls,
            engine,
        }
    }

    async fn reconcile(&self) -> Result<Outcome, Error> {
        self.engine.reconcile(NS, NAME).await
    }

    fn status(&self) -> SchedulingDecisionStatus {
        self.cluster
            .object::<SchedulingDecision>(NS, NAME)
            .and_then(|c| c.status)
            .unwrap()
    }

    fn inferences(&self) -> Vec<Inference> {
        let mut names: Vec<Inference> = (0..10)
            .filter_map(|n| self.cluster.object::<Inference>(NS, &format!("{NAME}-{n}")))
            .collect();
        names.sort_by_key(|i| i.name_any());
        names
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn finish(&self, name: &str, succeeded: bool) {
        self.cluster.modify::<Inference>(NS, name, |inference| {
            let status = inference.status.get_or_insert_with(Default::default);
            status.mark_created("created");
            if succeeded {
                status.monitor_result = Some(MonitoringResult::sentinel::<&str>(name, &[], "1.0"));
                status.mark_succeeded(true, "done");
            } else {
                status.mark_failed("client job failed");
            }
        });
    }
}

#[tokio::test]
async fn first_reconcile_only_marks_created() {
    let harness = Harness::new(5, 2, 0);

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Active);

    let status = harness.status();
    assert!(status.start_time.is_some());
    assert!(status.conditions.has(SchedulingConditionType::Created));
    assert_eq!(harness.calls(), 0);
    assert!(harness.inferences().is_empty());
}

#[tokio::test]
async fn free_slots_are_filled_from_suggestions() {
    let harness = Harness::new(5, 2, 0);
    harness.reconcile().await.unwrap();
    harness.reconcile().await.unwrap();

    assert_eq!(harness.calls(), 1);
    let inferences = harness.inferences();
    assert_eq!(inferences.len(), 2);

    let campaign = harness
        .cluster
        .object::<SchedulingDecision>(NS, NAME)
        .unwrap();
    for inference in &inferences {
        assert_eq!(
            inference.labels().get(CAMPAIGN_LABEL).map(String::as_str),
            Some(NAME)
        );
        assert_eq!(inference.owner_references()[0].uid, campaign.uid().unwrap());
        assert_eq!(inference.spec.target_node.as_deref(), Some("node-a"));
        assert_eq!(inference.spec.assignments[0].value, "500m");
        assert_eq!(
            inference.spec.request_template.as_deref(),
            Some("{\"instances\": []}")
        );
    }
    assert!(harness.status().conditions.has(SchedulingConditionType::Running));

    // Both slots are taken now.
    harness.reconcile().await.unwrap();
    assert_eq!(harness.calls(), 1);
    let status = harness.status();
    assert_eq!(status.inferences_total, 2);
    assert_eq!(status.pending_inference_list, vec!["sweep-0", "sweep-1"]);
    assert_eq!(status.scheduling_results.len(), 2);
}

#[tokio::test]
async fn lost_status_race_does_not_duplicate_inferences() {
    let harness = Harness::new(5, 2, 0);
    harness.reconcile().await.unwrap();
    harness.cluster.conflict_next_status_write();

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Active);
    assert_eq!(harness.inferences().len(), 2);
    assert!(!harness.status().conditions.has(SchedulingConditionType::Running));

    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Active);
    assert_eq!(harness.calls(), 1);
    assert_eq!(harness.inferences().len(), 2);
    let status = harness.status();
    assert!(status.conditions.has(SchedulingConditionType::Running));
    assert_eq!(status.inferences_pending, 2);
}

#[tokio::test]
async fn short_suggestion_response_creates_nothing() {
    let harness = Harness::new(5, 2, 1);
    harness.reconcile().await.unwrap();
    let before = harness.status();
    harness.cluster.clear_writes();

    let err = harness.reconcile().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Scheduling(SchedulingError::CardinalityMismatch { .. })
    ));
    assert!(harness.inferences().is_empty());
    assert!(harness.cluster.writes().is_empty());
    assert_eq!(harness.status(), before);
}

#[tokio::test]
async fn finished_slot_is_refilled() {
    let harness = Harness::new(3, 1, 0);
    harness.reconcile().await.unwrap();
    harness.reconcile().await.unwrap();
    assert_eq!(harness.inferences().len(), 1);

    harness.finish("sweep-0", false);
    harness.reconcile().await.unwrap();

    assert_eq!(harness.calls(), 2);
    assert_eq!(harness.inferences().len(), 2);
    assert_eq!(harness.status().failed_inference_list, vec!["sweep-0"]);
}

#[tokio::test]
async fn campaign_completes_when_all_inferences_finish() {
    let harness = Harness::new(2, 2, 0);
    harness.reconcile().await.unwrap();
    harness.reconcile().await.unwrap();

    harness.finish("sweep-0", true);
    harness.finish("sweep-1", false);
    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);

    let status = harness.status();
    assert!(status.conditions.has(SchedulingConditionType::Succeeded));
    assert!(!status.conditions.has(SchedulingConditionType::Running));
    assert!(status.completion_time.is_some());
    assert_eq!(status.succeeded_inference_list, vec!["sweep-0"]);
    assert_eq!(status.failed_inference_list, vec!["sweep-1"]);
    assert_eq!(status.current_monitoring.len(), 1);
    assert_eq!(harness.calls(), 1);
    assert!(harness
        .cluster
        .events()
        .iter()
        .any(|e| e.event.reason == "SchedulingCompleted"));

    harness.cluster.clear_writes();
    assert_eq!(harness.reconcile().await.unwrap(), Outcome::Terminal);
    assert!(harness.cluster.writes().is_empty());
}

#[tokio::test]
async fn foreign_inferences_are_not_counted() {
    let harness = Harness::new(5, 1, 0);
    harness.reconcile().await.unwrap();

    let mut stray = Inference::new("stray", InferenceSpec::default());
    stray.metadata.namespace = Some(NS.to_string());
    stray.metadata.labels = Some([(CAMPAIGN_LABEL.to_string(), NAME.to_string())].into());
    harness.cluster.insert(stray);

    harness.reconcile().await.unwrap();
    let status = harness.status();
    assert_eq!(status.inferences_total, 0);
    assert_eq!(harness.calls(), 1);
    assert!(harness
        .cluster
        .writes()
        .iter()
        .any(|w| w.verb == Verb::Create && w.kind == "Inference"));
}
