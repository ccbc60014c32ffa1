//! In-memory doubles for the store and cluster traits

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{future, stream, StreamExt};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::ErrorResponse;
use kube::ResourceExt;
use serde_json::json;
use uuid::Uuid;

use crate::cluster::{ClusterClient, ClusterEvent, EventStream, ObjectKind, WORKLOAD_KIND};
use crate::controller::resources;
use crate::error::{Error, Result};
use crate::model::{
    AuditEntry, ClusterIdentity, ConnectionInfo, JobStatus, JobType, LifecycleMode,
    ProvisioningJob, Resource, ResourceStatus,
};
use crate::store::ResourceStore;

/// A pending `full` resource in `team-a`
pub fn resource(name: &str, resource_type: &str) -> Resource {
    Resource {
        id: Uuid::new_v4(),
        name: name.to_string(),
        team_id: Uuid::new_v4(),
        resource_type: resource_type.to_string(),
        lifecycle_mode: LifecycleMode::Full,
        config: json!({ "replicas": 1 }),
        namespace: "team-a".to_string(),
        status: ResourceStatus::Pending,
        k8s_namespace: None,
        k8s_resource_name: None,
        k8s_resource_type: None,
        connection_info: None,
        deleted_at: None,
    }
}

pub fn pod(namespace: &str, name: &str, owner: Option<&str>, phase: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|owner| {
                vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: WORKLOAD_KIND.to_string(),
                    name: owner.to_string(),
                    uid: Uuid::new_v4().to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: Some("10.0.0.10".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Pod `<workload>-<ordinal>` carrying the resource's labels and owner reference
pub fn resource_pod(resource: &Resource, ordinal: usize, phase: &str, ready: bool) -> Pod {
    let (namespace, name) = resources::cluster_target(resource);
    let mut pod = pod(
        &namespace,
        &format!("{name}-{ordinal}"),
        Some(&name),
        phase,
        ready,
    );
    pod.metadata.labels = Some(resources::standard_labels(resource));
    pod
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[derive(Default)]
struct StoreState {
    resources: BTreeMap<Uuid, Resource>,
    jobs: Vec<ProvisioningJob>,
    audits: Vec<AuditEntry>,
    status_history: Vec<(Uuid, ResourceStatus)>,
    writes: usize,
}

impl StoreState {
    fn resource_mut(&mut self, id: Uuid) -> Result<&mut Resource> {
        self.resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))
    }

    fn set_status(&mut self, id: Uuid, status: ResourceStatus) -> Result<()> {
        self.resource_mut(id)?.status = status;
        self.status_history.push((id, status));
        Ok(())
    }

    fn close_job(
        &mut self,
        job_id: Uuid,
        status: JobStatus,
        logs: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running)
            .ok_or_else(|| Error::NotFound(format!("running job {job_id}")))?;
        job.status = status;
        job.completed_at = Some(Utc::now());
        job.logs = logs.to_string();
        job.error_message = error.map(str::to_string);
        Ok(())
    }
}

/// [`ResourceStore`] backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: Resource) {
        let mut state = lock(&self.state);
        state.status_history.push((resource.id, resource.status));
        state.resources.insert(resource.id, resource);
    }

    pub fn resource(&self, id: Uuid) -> Resource {
        lock(&self.state).resources[&id].clone()
    }

    pub fn set_config(&self, id: Uuid, config: serde_json::Value) {
        if let Some(r) = lock(&self.state).resources.get_mut(&id) {
            r.config = config;
        }
    }

    pub fn soft_delete(&self, id: Uuid) {
        if let Some(r) = lock(&self.state).resources.get_mut(&id) {
            r.deleted_at = Some(Utc::now());
        }
    }

    pub fn jobs(&self) -> Vec<ProvisioningJob> {
        lock(&self.state).jobs.clone()
    }

    pub fn audits(&self) -> Vec<AuditEntry> {
        lock(&self.state).audits.clone()
    }

    pub fn actions(&self) -> Vec<String> {
        lock(&self.state)
            .audits
            .iter()
            .map(|a| a.action.clone())
            .collect()
    }

    pub fn status_history(&self, id: Uuid) -> Vec<ResourceStatus> {
        lock(&self.state)
            .status_history
            .iter()
            .filter(|(rid, _)| *rid == id)
            .map(|(_, status)| *status)
            .collect()
    }

    /// Number of write operations performed through the trait
    pub fn writes(&self) -> usize {
        lock(&self.state).writes
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_managed(&self) -> Result<Vec<Resource>> {
        Ok(lock(&self.state)
            .resources
            .values()
            .filter(|r| r.lifecycle_mode == LifecycleMode::Full && r.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn list_pending_deletions(&self) -> Result<Vec<Resource>> {
        Ok(lock(&self.state)
            .resources
            .values()
            .filter(|r| {
                r.lifecycle_mode == LifecycleMode::Full
                    && r.deleted_at.is_some()
                    && r.status != ResourceStatus::Deleted
            })
            .cloned()
            .collect())
    }

    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(lock(&self.state).resources.get(&id).cloned())
    }

    async fn find_by_cluster_object(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Resource>> {
        Ok(lock(&self.state)
            .resources
            .values()
            .find(|r| {
                r.k8s_namespace.as_deref() == Some(namespace)
                    && r.k8s_resource_name.as_deref() == Some(name)
            })
            .cloned())
    }

    async fn update_status(&self, id: Uuid, status: ResourceStatus) -> Result<()> {
        let mut state = lock(&self.state);
        state.writes += 1;
        state.set_status(id, status)
    }

    async fn mark_error(&self, id: Uuid, message: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.writes += 1;
        let resource = state.resource_mut(id)?;
        let mut info = match resource.connection_info.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        info.insert("error".to_string(), json!(message));
        resource.connection_info = Some(serde_json::Value::Object(info));
        state.set_status(id, ResourceStatus::Error)
    }

    async fn record_cluster_object(&self, id: Uuid, identity: &ClusterIdentity) -> Result<()> {
        let mut state = lock(&self.state);
        state.writes += 1;
        let resource = state.resource_mut(id)?;
        resource.k8s_namespace = Some(identity.namespace.clone());
        resource.k8s_resource_name = Some(identity.name.clone());
        resource.k8s_resource_type = Some(identity.kind.clone());
        Ok(())
    }

    async fn update_connection_info(
        &self,
        id: Uuid,
        info: &ConnectionInfo,
        status: ResourceStatus,
    ) -> Result<()> {
        let value = serde_json::to_value(info)?;
        let mut state = lock(&self.state);
        state.writes += 1;
        state.resource_mut(id)?.connection_info = Some(value);
        state.set_status(id, status)
    }

    async fn open_job(&self, resource_id: Uuid, job_type: JobType) -> Result<Uuid> {
        let mut state = lock(&self.state);
        state.writes += 1;
        let id = Uuid::new_v4();
        state.jobs.push(ProvisioningJob {
            id,
            resource_id,
            job_type,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            logs: String::new(),
            error_message: None,
        });
        Ok(id)
    }

    async fn complete_job(&self, job_id: Uuid, logs: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.writes += 1;
        state.close_job(job_id, JobStatus::Completed, logs, None)
    }

    async fn fail_job(&self, job_id: Uuid, logs: &str, error: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.writes += 1;
        state.close_job(job_id, JobStatus::Failed, logs, Some(error))
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut state = lock(&self.state);
        state.writes += 1;
        state.audits.push(entry.clone());
        Ok(())
    }
}

type ObjectKey = (String, String);

const IDLE_WATCH: Duration = Duration::from_millis(20);

#[derive(Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    workloads: BTreeMap<ObjectKey, StatefulSet>,
    pods: BTreeMap<ObjectKey, Pod>,
    mutations: usize,
    creates: usize,
    fail_creates: bool,
    fail_namespace_listing: bool,
    scripts: HashMap<(String, ObjectKind), VecDeque<Vec<Result<ClusterEvent>>>>,
    watch_opens: HashMap<(String, ObjectKind), usize>,
}

/// [`ClusterClient`] backed by process memory. Each watch open replays the
/// next scripted batch; an unscripted watch closes after a short idle period.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&self, name: &str) {
        lock(&self.state).namespaces.insert(name.to_string());
    }

    pub fn remove_namespace(&self, name: &str) {
        lock(&self.state).namespaces.remove(name);
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        lock(&self.state).namespaces.contains(name)
    }

    pub fn fail_namespace_listing(&self, fail: bool) {
        lock(&self.state).fail_namespace_listing = fail;
    }

    pub fn fail_creates(&self, fail: bool) {
        lock(&self.state).fail_creates = fail;
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        lock(&self.state)
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn workload_count(&self) -> usize {
        lock(&self.state).workloads.len()
    }

    pub fn insert_workload(&self, workload: StatefulSet) {
        let key = (workload.namespace().unwrap_or_default(), workload.name_any());
        lock(&self.state).workloads.insert(key, workload);
    }

    pub fn remove_workload(&self, namespace: &str, name: &str) {
        lock(&self.state)
            .workloads
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Report `ready` replicas in the workload's status
    pub fn set_ready_replicas(&self, namespace: &str, name: &str, ready: i32) {
        let mut state = lock(&self.state);
        if let Some(workload) = state
            .workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            let replicas = resources::observed_replicas(workload);
            workload.status = Some(StatefulSetStatus {
                replicas,
                ready_replicas: Some(ready),
                ..Default::default()
            });
        }
    }

    pub fn insert_pod(&self, pod: Pod) {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        lock(&self.state).pods.insert(key, pod);
    }

    /// Create, scale, delete and namespace calls seen so far
    pub fn mutations(&self) -> usize {
        lock(&self.state).mutations
    }

    pub fn creates(&self) -> usize {
        lock(&self.state).creates
    }

    /// Queue the events the next watch open for `(namespace, kind)` replays
    pub fn script_watch(&self, namespace: &str, kind: ObjectKind, events: Vec<Result<ClusterEvent>>) {
        lock(&self.state)
            .scripts
            .entry((namespace.to_string(), kind))
            .or_default()
            .push_back(events);
    }

    pub fn watch_opens(&self, namespace: &str, kind: ObjectKind) -> usize {
        lock(&self.state)
            .watch_opens
            .get(&(namespace.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_namespaces(&self, prefix: &str) -> Result<Vec<String>> {
        let state = lock(&self.state);
        if state.fail_namespace_listing {
            return Err(Error::ClusterError("namespace listing unavailable".to_string()));
        }
        Ok(state
            .namespaces
            .iter()
            .filter(|ns| ns.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.mutations += 1;
        state.namespaces.insert(name.to_string());
        Ok(())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.workload(namespace, name))
    }

    async fn create_workload(&self, workload: &StatefulSet) -> Result<()> {
        let mut state = lock(&self.state);
        state.mutations += 1;
        if state.fail_creates {
            return Err(api_error(500, "InternalError", "create rejected".to_string()));
        }
        let key = (workload.namespace().unwrap_or_default(), workload.name_any());
        if state.workloads.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} exists", key.1)));
        }
        state.creates += 1;
        state.workloads.insert(key, workload.clone());
        Ok(())
    }

    async fn scale_workload(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let mut state = lock(&self.state);
        state.mutations += 1;
        let workload = state
            .workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        if let Some(spec) = workload.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.mutations += 1;
        state
            .workloads
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(lock(&self.state)
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches_selector(pod, label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn watch(&self, namespace: &str, kind: ObjectKind) -> Result<EventStream> {
        let mut state = lock(&self.state);
        let key = (namespace.to_string(), kind);
        *state.watch_opens.entry(key.clone()).or_default() += 1;
        match state.scripts.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(events) => Ok(stream::iter(events).boxed()),
            None => Ok(stream::once(tokio::time::sleep(IDLE_WATCH))
                .filter_map(|()| future::ready(None::<Result<ClusterEvent>>))
                .boxed()),
        }
    }
}
