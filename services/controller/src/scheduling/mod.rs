//! SchedulingDecision controller.
//!
//! A campaign keeps at most `parallelism` Inferences active and creates at
//! most `maxNumInferences` in total. Each tick tallies the owned Inferences
//! by phase, then asks the scheduling service to fill the free slots.

mod client;

use std::collections::BTreeMap;
use std::sync::Arc;

use cadence_api::{
    Inference, InferenceConditionType, InferenceSpec, MonitoringResult, SchedulingDecision,
    SchedulingDecisionStatus, SchedulingResult, CAMPAIGN_LABEL,
};
use chrono::Utc;
use futures_util::StreamExt;
use kube::api::ObjectMeta;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

pub use client::{
    classify_assignment, Decision, ExistingResult, HttpSuggestionService, KeyValue,
    SchedulingClient, SchedulingError, SuggestionRequest, SuggestionResponse, SuggestionService,
};

use crate::cluster::{ClusterApi, ClusterError, ClusterEvent};
use crate::context::{shutdown_signal, ControllerContext};
use crate::{reasons, Error, Outcome, Result};

/// Phase of an owned Inference as the campaign counts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

/// Classify an Inference by its conditions. A job that finished without
/// metrics yet still counts as running.
pub fn phase(inference: &Inference) -> Phase {
    let finished_without_metrics = inference
        .status
        .as_ref()
        .is_some_and(|s| s.conditions.get(InferenceConditionType::Succeeded).is_some());

    if inference.is_killed() {
        Phase::Killed
    } else if inference.is_failed() {
        Phase::Failed
    } else if inference.is_succeeded() {
        Phase::Succeeded
    } else if inference.is_running() || finished_without_metrics {
        Phase::Running
    } else {
        Phase::Pending
    }
}

/// Write name lists and counters for `children` into `status`.
fn tally(status: &mut SchedulingDecisionStatus, children: &[Inference]) {
    let mut lists: BTreeMap<Phase, Vec<String>> = BTreeMap::new();
    for child in children {
        lists.entry(phase(child)).or_default().push(child.name_any());
    }
    let mut take = |p: Phase| {
        let mut names = lists.remove(&p).unwrap_or_default();
        names.sort();
        names
    };

    status.pending_inference_list = take(Phase::Pending);
    status.running_inference_list = take(Phase::Running);
    status.succeeded_inference_list = take(Phase::Succeeded);
    status.failed_inference_list = take(Phase::Failed);
    status.killed_inference_list = take(Phase::Killed);

    status.inferences_pending = status.pending_inference_list.len() as i32;
    status.inferences_running = status.running_inference_list.len() as i32;
    status.inferences_succeeded = status.succeeded_inference_list.len() as i32;
    status.inferences_failed = status.failed_inference_list.len() as i32;
    status.inferences_killed = status.killed_inference_list.len() as i32;
    status.inferences_total = children.len() as i32;
}

fn placement(inference: &Inference) -> SchedulingResult {
    SchedulingResult {
        target_inference_name: inference.name_any(),
        target_node: inference.spec.target_node.clone().unwrap_or_default(),
        resource_assignments: inference.spec.assignments.clone(),
    }
}

/// Drives one SchedulingDecision until its campaign is complete.
pub struct CampaignEngine<C, S> {
    cluster: Arc<C>,
    scheduler: SchedulingClient<S>,
}

impl<C: ClusterApi, S: SuggestionService> CampaignEngine<C, S> {
    pub fn new(cluster: Arc<C>, scheduler: SchedulingClient<S>) -> Self {
        Self { cluster, scheduler }
    }

    /// Reconcile one campaign and persist its status if the tick changed it.
    #[instrument(skip_all, fields(namespace = %namespace, campaign = %name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let Some(original) = self
            .cluster
            .get::<SchedulingDecision>(namespace, name)
            .await?
        else {
            debug!("SchedulingDecision no longer exists");
            return Ok(Outcome::NotFound);
        };

        if original.is_completed() {
            return Ok(Outcome::Terminal);
        }

        let mut campaign = original.clone();
        if let Err(e) = self.tick(namespace, &mut campaign).await {
            self.publish(
                &original,
                ClusterEvent::warning(reasons::RECONCILE_FAILED, e.to_string()),
            )
            .await;
            return Err(e);
        }

        if campaign.status != original.status {
            match self.cluster.update_status(namespace, &campaign).await {
                Ok(_) => debug!("Status updated"),
                Err(e) if e.is_conflict() => {
                    debug!(error = %e, "Status write lost a race, next reconcile corrects it");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(if campaign.is_completed() {
            Outcome::Terminal
        } else {
            Outcome::Active
        })
    }

    async fn tick(&self, namespace: &str, campaign: &mut SchedulingDecision) -> Result<()> {
        let name = campaign.name_any();
        let uid = campaign.uid().ok_or_else(|| Error::MissingUid {
            kind: "SchedulingDecision",
            name: name.clone(),
        })?;

        if !campaign.is_created() {
            let status = campaign.status.get_or_insert_with(Default::default);
            if status.start_time.is_none() {
                status.start_time = Some(Utc::now());
            }
            status.mark_created("SchedulingDecision is created");
            info!("SchedulingDecision created");
            self.publish(
                campaign,
                ClusterEvent::normal(reasons::CREATED, "SchedulingDecision is created"),
            )
            .await;
            return Ok(());
        }

        let selector = format!("{CAMPAIGN_LABEL}={name}");
        let mut children: Vec<Inference> = self
            .cluster
            .list::<Inference>(namespace, &selector)
            .await?
            .into_iter()
            .filter(|i| i.owner_references().iter().any(|o| o.uid == uid))
            .collect();
        children.sort_by_key(|i| i.name_any());

        let max_total = campaign.spec.max_num_inferences;
        let parallelism = campaign.parallelism();

        let (total, active) = {
            let status = campaign.status.get_or_insert_with(Default::default);
            tally(status, &children);
            status.scheduling_results = children.iter().map(placement).collect();
            status.current_monitoring = children
                .iter()
                .filter(|i| i.is_succeeded())
                .filter_map(|i| i.status.as_ref()?.monitor_result.clone())
                .collect::<Vec<MonitoringResult>>();
            (status.inferences_total, status.active())
        };

        if total >= max_total && active == 0 {
            let status = campaign.status.get_or_insert_with(Default::default);
            status.mark_succeeded("SchedulingDecision is completed");
            if status.completion_time.is_none() {
                status.completion_time = Some(Utc::now());
            }
            info!(total, "SchedulingDecision completed");
            self.publish(
                campaign,
                ClusterEvent::normal(
                    reasons::SCHEDULING_COMPLETED,
                    format!("All {total} inferences finished"),
                ),
            )
            .await;
            return Ok(());
        }

        if let Some(status) = campaign.status.as_mut() {
            status.mark_running("SchedulingDecision is running");
        }

        let need = (parallelism - active).min(max_total - total);
        if need <= 0 {
            debug!(active, total, "No free slots");
            return Ok(());
        }

        let results = self
            .scheduler
            .request_suggestions(need, campaign, total, &children)
            .await?;

        for result in &results {
            let inference = self.stamp(campaign, result)?;
            let child = inference.name_any();
            match self.cluster.create(namespace, &inference).await {
                Ok(_) => info!(inference = %child, node = %result.target_node, "Created inference"),
                Err(ClusterError::AlreadyExists { .. }) => {
                    debug!(inference = %child, "Inference already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Build a new Inference from the campaign template and one placement.
    fn stamp(&self, campaign: &SchedulingDecision, result: &SchedulingResult) -> Result<Inference> {
        let owner = campaign
            .controller_owner_ref(&())
            .ok_or_else(|| Error::MissingUid {
                kind: "SchedulingDecision",
                name: campaign.name_any(),
            })?;

        let name = if result.target_inference_name.is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", campaign.name_any(), &suffix[..8])
        } else {
            result.target_inference_name.clone()
        };

        let mut spec: InferenceSpec = campaign.spec.inference_template.clone();
        if !result.target_node.is_empty() {
            spec.target_node = Some(result.target_node.clone());
        }
        spec.assignments = result.resource_assignments.clone();
        if campaign.spec.request_template.is_some() {
            spec.request_template = campaign.spec.request_template.clone();
        }
        if campaign.spec.client_template.is_some() {
            spec.client_template = campaign.spec.client_template.clone();
        }

        Ok(Inference {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: campaign.namespace(),
                labels: Some(BTreeMap::from([(
                    CAMPAIGN_LABEL.to_string(),
                    campaign.name_any(),
                )])),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec,
            status: None,
        })
    }

    async fn publish(&self, campaign: &SchedulingDecision, event: ClusterEvent) {
        let reference = campaign.object_ref(&());
        if let Err(e) = self.cluster.publish_event(&reference, &event).await {
            warn!(error = %e, reason = %event.reason, "Failed to publish event");
        }
    }
}

fn key(campaign: &SchedulingDecision) -> String {
    format!(
        "{}/{}",
        campaign.namespace().unwrap_or_default(),
        campaign.name_any()
    )
}

async fn reconcile<C: ClusterApi, S: SuggestionService>(
    campaign: Arc<SchedulingDecision>,
    ctx: Arc<ControllerContext<CampaignEngine<C, S>>>,
) -> Result<Action, Error> {
    let namespace = campaign.namespace().unwrap_or_default();
    let outcome = ctx
        .reconciler
        .reconcile(&namespace, &campaign.name_any())
        .await?;
    ctx.reset(&key(&campaign));
    Ok(ctx.action_for(outcome))
}

fn error_policy<C: ClusterApi, S: SuggestionService>(
    campaign: Arc<SchedulingDecision>,
    error: &Error,
    ctx: Arc<ControllerContext<CampaignEngine<C, S>>>,
) -> Action {
    let key = key(&campaign);
    let delay = ctx.requeue_after_failure(&key);
    warn!(campaign = %key, error = %error, retry_in_secs = delay.as_secs(), "Reconcile failed");
    Action::requeue(delay)
}

/// Watch SchedulingDecisions and their Inferences until shutdown.
pub async fn run<C: ClusterApi, S: SuggestionService>(
    client: Client,
    ctx: Arc<ControllerContext<CampaignEngine<C, S>>>,
    shutdown: watch::Receiver<bool>,
) {
    info!("SchedulingDecision controller starting");

    Controller::new(
        Api::<SchedulingDecision>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(Api::<Inference>::all(client), watcher::Config::default())
    .graceful_shutdown_on(shutdown_signal(shutdown))
    .run(reconcile::<C, S>, error_policy::<C, S>, ctx)
    .for_each(|result| async move {
        match result {
            Ok((object, _)) => debug!(campaign = %object.name, "Reconciled"),
            Err(e) => debug!(error = %e, "Controller stream error"),
        }
    })
    .await;

    info!("SchedulingDecision controller stopped");
}
