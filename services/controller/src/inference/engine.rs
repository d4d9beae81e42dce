use std::sync::Arc;

use cadence_api::{Inference, InferenceStatus, MonitoringResult, ServingStatus};
use cadence_metrics_store::{monitoring_result, StorageBackend};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError, ClusterEvent, ClusterObject};
use crate::planner::{self, JobEnvironment, PlanError};
use crate::{reasons, Error, Outcome, Result};

/// Drives one Inference through Created → Pending → Running → terminal.
pub struct InferenceEngine<C> {
    cluster: Arc<C>,
    metrics: Arc<dyn StorageBackend>,
    env: JobEnvironment,
    default_metric_value: String,
}

fn has_true_condition<'a>(
    mut conditions: impl Iterator<Item = (&'a str, &'a str)>,
    type_: &str,
) -> bool {
    conditions.any(|(t, status)| t == type_ && status == "True")
}

fn deployment_condition(deployment: &Deployment, type_: &str) -> bool {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    has_true_condition(
        conditions.iter().map(|c| (c.type_.as_str(), c.status.as_str())),
        type_,
    )
}

fn job_condition(job: &Job, type_: &str) -> bool {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    has_true_condition(
        conditions.iter().map(|c| (c.type_.as_str(), c.status.as_str())),
        type_,
    )
}

fn serving_statuses(inference: &Inference, deployment: &Deployment) -> Vec<ServingStatus> {
    let observed = deployment.status.as_ref();
    let replicas = observed.and_then(|s| s.replicas).unwrap_or_default();
    let ready_replicas = observed.and_then(|s| s.ready_replicas).unwrap_or_default();

    inference
        .spec
        .servings
        .iter()
        .map(|slot| ServingStatus {
            name: if slot.name.is_empty() {
                inference.container_name()
            } else {
                slot.name.clone()
            },
            replicas,
            ready_replicas,
        })
        .collect()
}

/// Set the terminal condition and stamp the completion time once.
fn finish(inference: &mut Inference, mark: impl FnOnce(&mut InferenceStatus)) {
    let status = inference.status.get_or_insert_with(Default::default);
    mark(status);
    if status.completion_time.is_none() {
        status.completion_time = Some(Utc::now());
    }
}

impl<C: ClusterApi> InferenceEngine<C> {
    pub fn new(
        cluster: Arc<C>,
        metrics: Arc<dyn StorageBackend>,
        env: JobEnvironment,
        default_metric_value: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            metrics,
            env,
            default_metric_value: default_metric_value.into(),
        }
    }

    /// Reconcile one Inference and persist its status if the tick changed it.
    #[instrument(skip_all, fields(namespace = %namespace, inference = %name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let Some(original) = self.cluster.get::<Inference>(namespace, name).await? else {
            debug!("Inference no longer exists");
            return Ok(Outcome::NotFound);
        };

        let mut inference = original.clone();
        if let Err(e) = self.tick(namespace, &mut inference).await {
            self.publish(
                &original,
                ClusterEvent::warning(reasons::RECONCILE_FAILED, e.to_string()),
            )
            .await;
            return Err(e);
        }

        if inference.status != original.status {
            match self.cluster.update_status(namespace, &inference).await {
                Ok(_) => debug!("Status updated"),
                Err(e) if e.is_conflict() => {
                    debug!(error = %e, "Status write lost a race, next reconcile corrects it");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(if inference.is_terminal() {
            Outcome::Terminal
        } else {
            Outcome::Active
        })
    }

    async fn tick(&self, namespace: &str, inference: &mut Inference) -> Result<()> {
        if !inference.is_created() {
            let status = inference.status.get_or_insert_with(Default::default);
            if status.start_time.is_none() {
                status.start_time = Some(Utc::now());
            }
            status.mark_created("Inference is created");
            info!("Inference created");
            self.publish(
                inference,
                ClusterEvent::normal(reasons::CREATED, "Inference is created"),
            )
            .await;
            return Ok(());
        }

        if inference.is_terminal() {
            return self.teardown(namespace, inference).await;
        }

        if inference.kill_requested() {
            finish(inference, |s| s.mark_killed("Inference is killed"));
            info!("Inference killed on request");
            self.publish(
                inference,
                ClusterEvent::normal(reasons::KILLED, "Inference is killed"),
            )
            .await;
            return self.teardown(namespace, inference).await;
        }

        let plan = match planner::plan(inference, &self.env) {
            Ok(plan) => plan,
            Err(PlanError::MissingUid) => {
                return Err(Error::MissingUid {
                    kind: "Inference",
                    name: inference.name_any(),
                })
            }
            Err(e) => {
                let message = format!("Invalid inference spec: {e}");
                warn!(error = %e, "Inference spec cannot be planned");
                finish(inference, |s| s.mark_failed(&message));
                self.publish(inference, ClusterEvent::warning(reasons::INVALID_SPEC, message.clone()))
                    .await;
                return self.teardown(namespace, inference).await;
            }
        };

        self.ensure(namespace, &plan.service).await?;
        let deployment = self.ensure(namespace, &plan.deployment).await?;

        let endpoint = inference.endpoint();
        let servings = serving_statuses(inference, &deployment);
        {
            let status = inference.status.get_or_insert_with(Default::default);
            status.serving_statuses = servings;
            status.inference_endpoint = Some(endpoint);
        }

        if deployment_condition(&deployment, "ReplicaFailure") {
            warn!("Inference service pod failed");
            self.record_sentinel(inference);
            finish(inference, |s| s.mark_failed("Inference service pod failed"));
            self.publish(
                inference,
                ClusterEvent::warning(reasons::SERVICE_FAILED, "Inference service pod failed"),
            )
            .await;
            return self.teardown(namespace, inference).await;
        }

        if !deployment_condition(&deployment, "Available") {
            if let Some(status) = inference.status.as_mut() {
                status.mark_pending("Inference service is not available yet");
            }
            return Ok(());
        }

        let job = self.ensure(namespace, &plan.job).await?;

        if job_condition(&job, "Failed") {
            warn!("Client job failed");
            self.record_sentinel(inference);
            finish(inference, |s| s.mark_failed("Client job failed"));
            self.publish(inference, ClusterEvent::warning(reasons::JOB_FAILED, "Client job failed"))
                .await;
            return self.teardown(namespace, inference).await;
        }

        if job_condition(&job, "Complete") {
            let name = inference.name_any();
            let rows = self.metrics.get(namespace, &name).await?;
            let result = monitoring_result(&name, &rows);

            if result.is_empty() {
                debug!(backend = self.metrics.name(), "Client job finished, no metrics yet");
                if let Some(status) = inference.status.as_mut() {
                    status.mark_succeeded(false, "Monitoring results are not available");
                }
                return Ok(());
            }

            info!(metrics = result.pod_metrics.len() + result.node_metrics.len(), "Inference succeeded");
            finish(inference, |s| {
                s.monitor_result = Some(result);
                s.mark_succeeded(true, "Inference succeeded");
            });
            self.publish(
                inference,
                ClusterEvent::normal(reasons::JOB_SUCCEEDED, "Client job succeeded"),
            )
            .await;
            return self.teardown(namespace, inference).await;
        }

        if let Some(status) = inference.status.as_mut() {
            status.mark_running("Client job is running");
        }
        Ok(())
    }

    /// Default-valued metrics for an Inference that produced none.
    fn record_sentinel(&self, inference: &mut Inference) {
        let result = MonitoringResult::sentinel(
            &inference.name_any(),
            inference.spec.optional_nodes.as_slice(),
            &self.default_metric_value,
        );
        inference.status.get_or_insert_with(Default::default).monitor_result = Some(result);
    }

    /// Return the existing child or create the desired one.
    async fn ensure<K: ClusterObject>(&self, namespace: &str, desired: &K) -> Result<K> {
        let name = desired.name_any();
        if let Some(existing) = self.cluster.get::<K>(namespace, &name).await? {
            return Ok(existing);
        }

        match self.cluster.create(namespace, desired).await {
            Ok(created) => {
                info!(kind = %K::kind(&()), child = %name, "Created child");
                Ok(created)
            }
            Err(ClusterError::AlreadyExists { kind, name }) => self
                .cluster
                .get::<K>(namespace, &name)
                .await?
                .ok_or(Error::Cluster(ClusterError::NotFound { kind, name })),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every child, Service first. Children already gone cost no write.
    async fn teardown(&self, namespace: &str, inference: &Inference) -> Result<()> {
        self.remove::<Service>(namespace, &inference.service_name()).await?;
        self.remove::<Deployment>(namespace, &inference.deployment_name()).await?;
        self.remove::<Job>(namespace, &inference.job_name()).await?;
        Ok(())
    }

    async fn remove<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<()> {
        if self.cluster.get::<K>(namespace, name).await?.is_none() {
            return Ok(());
        }
        match self.cluster.delete::<K>(namespace, name).await {
            Ok(()) => {
                info!(kind = %K::kind(&()), child = %name, "Deleted child");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, inference: &Inference, event: ClusterEvent) {
        let reference = inference.object_ref(&());
        if let Err(e) = self.cluster.publish_event(&reference, &event).await {
            warn!(error = %e, reason = %event.reason, "Failed to publish event");
        }
    }
}
