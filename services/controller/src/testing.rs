//! In-memory cluster for tests and local development.
//!
//! Objects are stored as JSON keyed by kind, namespace and name. Every
//! write bumps a resource version; status writes carrying a stale version
//! fail with [`ClusterError::Conflict`] the way the API server does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use crate::cluster::{ClusterApi, ClusterError, ClusterEvent, ClusterObject};

type ObjectKey = (String, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Delete,
    UpdateStatus,
}

/// One mutating call observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

/// One event published through the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub event: ClusterEvent,
}

/// Terminal state of a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Complete,
    Failed,
}

/// [`ClusterApi`] backed by a map.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    writes: Mutex<Vec<RecordedWrite>>,
    events: Mutex<Vec<RecordedEvent>>,
    rejected_kinds: Mutex<BTreeSet<String>>,
    racing_writer: AtomicBool,
    version: AtomicU64,
}

fn key<K: ClusterObject>(namespace: &str, name: &str) -> ObjectKey {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn matches_selector(object: &Value, selector: &str) -> bool {
    let labels = object.pointer("/metadata/labels");
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels
                .and_then(|l| l.get(k))
                .and_then(Value::as_str)
                .is_some_and(|actual| actual == v),
            None => labels.and_then(|l| l.get(term)).is_some(),
        })
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record(&self, verb: Verb, kind: &str, name: &str) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(RecordedWrite {
                verb,
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
    }

    fn lock_objects(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<ObjectKey, Value>>, ClusterError> {
        self.objects.lock().map_err(|_| ClusterError::Conflict {
            kind: "FakeCluster".to_string(),
            name: String::new(),
            message: "store lock poisoned".to_string(),
        })
    }

    /// Store an object without recording a write, filling in uid and version.
    pub fn insert<K: ClusterObject>(&self, object: K) -> K {
        let mut object = object;
        let namespace = object.namespace().unwrap_or_else(|| "default".to_string());
        let meta = object.meta_mut();
        meta.namespace = Some(namespace.clone());
        meta.resource_version = Some(self.next_version());
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }

        let value = serde_json::to_value(&object).unwrap_or_default();
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key::<K>(&namespace, &object.name_any()), value);
        }
        object
    }

    /// Read an object synchronously.
    pub fn object<K: ClusterObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let objects = self.objects.lock().ok()?;
        let value = objects.get(&key::<K>(namespace, name))?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Number of stored objects of a kind in a namespace.
    pub fn count<K: ClusterObject>(&self, namespace: &str) -> usize {
        let kind = K::kind(&()).to_string();
        self.objects
            .lock()
            .map(|objects| {
                objects
                    .keys()
                    .filter(|(k, ns, _)| *k == kind && ns == namespace)
                    .count()
            })
            .unwrap_or_default()
    }

    /// Mutate a stored object in place, bumping its version.
    pub fn modify<K: ClusterObject>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let Some(mut object) = self.object::<K>(namespace, name) else {
            return;
        };
        f(&mut object);
        object.meta_mut().resource_version = Some(self.next_version());
        if let (Ok(value), Ok(mut objects)) = (serde_json::to_value(&object), self.objects.lock()) {
            objects.insert(key::<K>(namespace, name), value);
        }
    }

    /// Set the `Available` and `ReplicaFailure` conditions of a Deployment.
    pub fn set_deployment_state(
        &self,
        namespace: &str,
        name: &str,
        available: bool,
        replica_failure: bool,
    ) {
        self.modify::<Deployment>(namespace, name, |deployment| {
            let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let condition = |type_: &str, status: bool| DeploymentCondition {
                type_: type_.to_string(),
                status: if status { "True" } else { "False" }.to_string(),
                ..Default::default()
            };
            deployment.status = Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(if available { replicas } else { 0 }),
                conditions: Some(vec![
                    condition("Available", available),
                    condition("ReplicaFailure", replica_failure),
                ]),
                ..Default::default()
            });
        });
    }

    /// Finish a Job with the given outcome.
    pub fn set_job_outcome(&self, namespace: &str, name: &str, outcome: JobOutcome) {
        self.modify::<Job>(namespace, name, |job| {
            let type_ = match outcome {
                JobOutcome::Complete => "Complete",
                JobOutcome::Failed => "Failed",
            };
            job.status = Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        });
    }

    /// Make every create of this kind fail.
    pub fn reject_creates(&self, kind: &str) {
        if let Ok(mut rejected) = self.rejected_kinds.lock() {
            rejected.insert(kind.to_string());
        }
    }

    /// Let another writer touch the object just before the next status
    /// write, so that write carries a stale resource version.
    pub fn conflict_next_status_write(&self) {
        self.racing_writer.store(true, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn clear_writes(&self) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.clear();
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClusterError> {
        let objects = self.lock_objects()?;
        match objects.get(&key::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<K>, ClusterError> {
        let kind = K::kind(&()).to_string();
        let objects = self.lock_objects()?;
        objects
            .iter()
            .filter(|((k, ns, _), value)| {
                *k == kind && ns == namespace && matches_selector(value, label_selector)
            })
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(ClusterError::from))
            .collect()
    }

    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let name = object.name_any();

        let rejected = self
            .rejected_kinds
            .lock()
            .map(|r| r.contains(&kind))
            .unwrap_or_default();
        if rejected {
            return Err(ClusterError::Conflict {
                kind,
                name,
                message: "create rejected".to_string(),
            });
        }

        if self.lock_objects()?.contains_key(&key::<K>(namespace, &name)) {
            return Err(ClusterError::AlreadyExists { kind, name });
        }

        debug!(kind = %kind, name = %name, "[FAKE] Creating object");
        let mut object = object.clone();
        object.meta_mut().namespace = Some(namespace.to_string());
        let created = self.insert(object);
        self.record(Verb::Create, &kind, &name);
        Ok(created)
    }

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let kind = K::kind(&()).to_string();
        let removed = self.lock_objects()?.remove(&key::<K>(namespace, name));
        self.record(Verb::Delete, &kind, name);
        match removed {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            }),
        }
    }

    async fn update_status<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let name = object.name_any();
        self.record(Verb::UpdateStatus, &kind, &name);

        let mut objects = self.lock_objects()?;
        let Some(stored) = objects.get_mut(&key::<K>(namespace, &name)) else {
            return Err(ClusterError::NotFound { kind, name });
        };

        if self.racing_writer.swap(false, Ordering::SeqCst) {
            stored["metadata"]["resourceVersion"] = Value::String(self.next_version());
        }

        let stored_version = stored
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        if stored_version != object.resource_version() {
            return Err(ClusterError::Conflict {
                kind,
                name,
                message: "the object has been modified".to_string(),
            });
        }

        let status = serde_json::to_value(object)?
            .get("status")
            .cloned()
            .unwrap_or(Value::Null);
        stored["status"] = status;
        stored["metadata"]["resourceVersion"] = Value::String(self.next_version());

        Ok(serde_json::from_value(stored.clone())?)
    }

    async fn publish_event(
        &self,
        reference: &ObjectReference,
        event: &ClusterEvent,
    ) -> Result<(), ClusterError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: reference.name.clone().unwrap_or_default(),
                event: event.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cadence_api::{Inference, InferenceSpec};
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    use super::*;

    fn service(name: &str, labels: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let cluster = FakeCluster::new();
        let created = cluster.create("ns", &service("a", &[])).await.unwrap();
        assert!(created.metadata.uid.is_some());

        let fetched: Option<Service> = cluster.get("ns", "a").await.unwrap();
        assert_eq!(fetched.unwrap().metadata.uid, created.metadata.uid);
        assert_eq!(cluster.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_create_twice_already_exists() {
        let cluster = FakeCluster::new();
        cluster.create("ns", &service("a", &[])).await.unwrap();
        let err = cluster.create("ns", &service("a", &[])).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let cluster = FakeCluster::new();
        let err = cluster.delete::<Service>("ns", "a").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_by_selector() {
        let cluster = FakeCluster::new();
        cluster.insert(service("a", &[("app", "x"), ("tier", "web")]));
        cluster.insert(service("b", &[("app", "x")]));
        cluster.insert(service("c", &[("app", "y")]));

        let xs: Vec<Service> = cluster.list("ns", "app=x").await.unwrap();
        assert_eq!(xs.len(), 2);

        let web: Vec<Service> = cluster.list("ns", "app=x,tier=web").await.unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].name_any(), "a");
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let cluster = FakeCluster::new();
        let inference = cluster.insert(Inference::new("inf", InferenceSpec::default()));

        let mut first = inference.clone();
        first.status = Some(Default::default());
        cluster.update_status("default", &first).await.unwrap();

        let err = cluster.update_status("default", &inference).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_racing_writer_conflicts_once() {
        let cluster = FakeCluster::new();
        let inference = cluster.insert(Inference::new("inf", InferenceSpec::default()));
        cluster.conflict_next_status_write();

        let err = cluster.update_status("default", &inference).await.unwrap_err();
        assert!(err.is_conflict());

        let fresh: Inference = cluster.get("default", "inf").await.unwrap().unwrap();
        cluster.update_status("default", &fresh).await.unwrap();
    }
}
