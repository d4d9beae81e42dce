//! Inference controller.

mod engine;

use std::sync::Arc;

use cadence_api::Inference;
use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use engine::InferenceEngine;

use crate::cluster::ClusterApi;
use crate::context::{shutdown_signal, ControllerContext};
use crate::Error;

fn key(inference: &Inference) -> String {
    format!(
        "{}/{}",
        inference.namespace().unwrap_or_default(),
        inference.name_any()
    )
}

async fn reconcile<C: ClusterApi>(
    inference: Arc<Inference>,
    ctx: Arc<ControllerContext<InferenceEngine<C>>>,
) -> Result<Action, Error> {
    let namespace = inference.namespace().unwrap_or_default();
    let outcome = ctx
        .reconciler
        .reconcile(&namespace, &inference.name_any())
        .await?;
    ctx.reset(&key(&inference));
    Ok(ctx.action_for(outcome))
}

fn error_policy<C: ClusterApi>(
    inference: Arc<Inference>,
    error: &Error,
    ctx: Arc<ControllerContext<InferenceEngine<C>>>,
) -> Action {
    let key = key(&inference);
    let delay = ctx.requeue_after_failure(&key);
    warn!(inference = %key, error = %error, retry_in_secs = delay.as_secs(), "Reconcile failed");
    Action::requeue(delay)
}

/// Watch Inferences and their children until shutdown.
pub async fn run<C: ClusterApi>(
    client: Client,
    ctx: Arc<ControllerContext<InferenceEngine<C>>>,
    shutdown: watch::Receiver<bool>,
) {
    info!("Inference controller starting");

    Controller::new(Api::<Inference>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Job>::all(client), watcher::Config::default())
        .graceful_shutdown_on(shutdown_signal(shutdown))
        .run(reconcile::<C>, error_policy::<C>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(inference = %object.name, "Reconciled"),
                Err(e) => debug!(error = %e, "Controller stream error"),
            }
        })
        .await;

    info!("Inference controller stopped");
}
