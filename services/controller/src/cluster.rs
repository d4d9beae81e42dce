//! Cluster API collaborator.
//!
//! Reconcilers never talk to `kube::Api` directly; they go through
//! [`ClusterApi`] so tests can swap in the in-memory
//! [`FakeCluster`](crate::testing::FakeCluster).

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Any namespaced object the controllers read or write.
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Cluster API errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist. Benign for reads and deletes.
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Create raced with another writer or a previous attempt.
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// The resource version on a write was stale.
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Any other API server or transport failure.
    #[error("kubernetes api error: {0}")]
    Kube(#[source] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// A user-visible event attached to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl ClusterEvent {
    pub fn normal(reason: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            note: note.into(),
            action: "Reconcile".to_string(),
        }
    }

    pub fn warning(reason: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            ..Self::normal(reason, note)
        }
    }
}

/// Cluster API operations used by the reconcilers.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str)
        -> Result<Option<K>, ClusterError>;

    /// List objects matching a `key=value[,key=value]` selector.
    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<K>, ClusterError>;

    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError>;

    /// Delete with foreground propagation.
    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Write the status subresource, guarded by the object's resource version.
    async fn update_status<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError>;

    async fn publish_event(
        &self,
        reference: &ObjectReference,
        event: &ClusterEvent,
    ) -> Result<(), ClusterError>;
}

/// [`ClusterApi`] over a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    recorder: Recorder,
}

impl KubeCluster {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: ClusterObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_error<K: ClusterObject>(name: &str, error: kube::Error) -> ClusterError {
    let kind = K::kind(&()).to_string();
    let name = name.to_string();
    match error {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound { kind, name },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists { kind, name }
        }
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict {
            kind,
            name,
            message: resp.message.clone(),
        },
        other => ClusterError::Kube(other),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClusterError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error::<K>(name, e))
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<K>, ClusterError> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| map_error::<K>(label_selector, e))?;
        Ok(list.items)
    }

    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError> {
        let name = object.name_any();
        debug!(kind = %K::kind(&()), name = %name, "Creating object");
        self.api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_error::<K>(&name, e))
    }

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        debug!(kind = %K::kind(&()), name = %name, "Deleting object");
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
            .map(|_| ())
            .map_err(|e| map_error::<K>(name, e))
    }

    async fn update_status<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let name = object.name_any();
        let status = serde_json::to_value(object)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        // A resourceVersion in the patch makes the API server reject stale writes.
        let patch = json!({
            "metadata": { "resourceVersion": object.resource_version() },
            "status": status,
        });

        self.api::<K>(namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error::<K>(&name, e))
    }

    async fn publish_event(
        &self,
        reference: &ObjectReference,
        event: &ClusterEvent,
    ) -> Result<(), ClusterError> {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: Some(event.note.clone()),
                    action: event.action.clone(),
                    secondary: None,
                },
                reference,
            )
            .await
            .map_err(ClusterError::Kube)
    }
}
