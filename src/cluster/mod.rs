//! Cluster access
//!
//! The reconciler, watcher and event handler only see the [`ClusterClient`]
//! capability trait. [`connect`] picks the credential source and returns the
//! kube-rs backed implementation.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::error::Result;

mod kube_client;

pub use kube_client::{connect, KubeClusterClient};

/// Kind recorded in `resources.k8s_resource_type` for managed workloads
pub const WORKLOAD_KIND: &str = "StatefulSet";

/// Object kinds the watcher streams
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Workload,
    Pod,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Workload => "workload",
            ObjectKind::Pod => "pod",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Modified => "modified",
            EventType::Deleted => "deleted",
        }
    }
}

/// Raw object carried by a watch event
#[derive(Clone, Debug)]
pub enum ObservedObject {
    Workload(Box<StatefulSet>),
    Pod(Box<Pod>),
}

impl ObservedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObservedObject::Workload(_) => ObjectKind::Workload,
            ObservedObject::Pod(_) => ObjectKind::Pod,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ObservedObject::Workload(w) => w.name_any(),
            ObservedObject::Pod(p) => p.name_any(),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        let labels = match self {
            ObservedObject::Workload(w) => w.metadata.labels.as_ref(),
            ObservedObject::Pod(p) => p.metadata.labels.as_ref(),
        };
        labels.and_then(|l| l.get(key)).map(String::as_str)
    }
}

/// One change observed on a watch stream
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    pub event_type: EventType,
    pub namespace: String,
    pub object: ObservedObject,
}

pub type EventStream = BoxStream<'static, Result<ClusterEvent>>;

/// Namespaced object operations used by the controller
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Names of namespaces starting with `prefix`
    async fn list_namespaces(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create the namespace if it does not exist
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Create a workload in the namespace named by its metadata
    async fn create_workload(&self, workload: &StatefulSet) -> Result<()>;

    /// Change only the replica count of an existing workload
    async fn scale_workload(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Delete a workload; a missing object is not an error
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Open one watch stream; it ends when the server closes the watch
    async fn watch(&self, namespace: &str, kind: ObjectKind) -> Result<EventStream>;
}
