//! Event-driven status updates
//!
//! Maps each watch event back to its owning resource and reflects what the
//! cluster reports into the resource row. This path never creates, scales or
//! deletes cluster objects.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::locks::ResourceLocks;
use super::registry::TypeRegistry;
use super::resources::{self, RESOURCE_ID_LABEL};
use crate::cluster::{ClusterClient, ClusterEvent, EventType, ObservedObject, WORKLOAD_KIND};
use crate::error::Result;
use crate::model::{Resource, ResourceStatus};
use crate::store::ResourceStore;

const POD_FAILED_PHASE: &str = "Failed";

/// What handling one event did to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Updated,
    Unchanged,
    Ignored,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Updated => "updated",
            EventOutcome::Unchanged => "unchanged",
            EventOutcome::Ignored => "ignored",
        }
    }
}

pub struct EventHandler {
    store: Arc<dyn ResourceStore>,
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<TypeRegistry>,
    locks: Arc<ResourceLocks>,
    cluster_domain: String,
}

impl EventHandler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<TypeRegistry>,
        locks: Arc<ResourceLocks>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cluster,
            registry,
            locks,
            cluster_domain: cluster_domain.into(),
        }
    }

    #[instrument(skip(self, event), fields(
        kind = %event.object.kind(),
        event = event.event_type.as_str(),
        namespace = %event.namespace,
        name = %event.object.name(),
    ))]
    pub async fn handle(&self, event: &ClusterEvent) -> Result<EventOutcome> {
        let Some(owner) = self.owner_id(event).await? else {
            debug!("No resource owns {}", event.object.name());
            return Ok(EventOutcome::Ignored);
        };

        let _guard = self.locks.acquire(owner).await;
        // Re-read under the lock so a concurrent reconcile's writes are seen
        let Some(resource) = self.store.get_resource(owner).await? else {
            return Ok(EventOutcome::Ignored);
        };
        if !resource.is_managed()
            || resource.is_deleted()
            || resource.status == ResourceStatus::Deleted
        {
            return Ok(EventOutcome::Ignored);
        }

        match (&event.object, event.event_type) {
            (ObservedObject::Pod(pod), _) if is_failed(pod) => {
                let message = format!("pod {} failed: {}", event.object.name(), failure_reason(pod));
                self.mark_error(&resource, message).await
            }
            (ObservedObject::Workload(_), EventType::Deleted) => {
                let message = format!(
                    "workload object {}/{} was deleted",
                    event.namespace,
                    event.object.name()
                );
                self.mark_error(&resource, message).await
            }
            (ObservedObject::Workload(workload), _) => {
                self.refresh(&resource, Some(workload.as_ref())).await
            }
            (ObservedObject::Pod(_), _) => self.refresh(&resource, None).await,
        }
    }

    async fn owner_id(&self, event: &ClusterEvent) -> Result<Option<Uuid>> {
        if let Some(id) = event
            .object
            .label(RESOURCE_ID_LABEL)
            .and_then(|raw| Uuid::parse_str(raw).ok())
        {
            return Ok(Some(id));
        }

        let object_name = match &event.object {
            ObservedObject::Pod(pod) => match workload_owner(pod) {
                Some(name) => name,
                None => return Ok(None),
            },
            ObservedObject::Workload(_) => event.object.name(),
        };

        Ok(self
            .store
            .find_by_cluster_object(&event.namespace, &object_name)
            .await?
            .map(|r| r.id))
    }

    async fn mark_error(&self, resource: &Resource, message: String) -> Result<EventOutcome> {
        let already_recorded = resource.status == ResourceStatus::Error
            && resource
                .observed_connection_info()
                .and_then(|info| info.error)
                .as_deref()
                == Some(message.as_str());
        if already_recorded {
            return Ok(EventOutcome::Unchanged);
        }

        warn!("Marking {} as error: {}", resource.name, message);
        self.store.mark_error(resource.id, &message).await?;
        Ok(EventOutcome::Updated)
    }

    async fn refresh(
        &self,
        resource: &Resource,
        observed: Option<&StatefulSet>,
    ) -> Result<EventOutcome> {
        let (namespace, name) = resources::cluster_target(resource);
        let fetched;
        let workload = match observed {
            Some(workload) => workload,
            None => match self.cluster.get_workload(&namespace, &name).await? {
                Some(workload) => {
                    fetched = workload;
                    &fetched
                }
                // Not created yet, or already gone; the periodic pass handles both
                None => return Ok(EventOutcome::Ignored),
            },
        };

        let desired = resource
            .desired_config()
            .map(|config| config.replicas)
            .unwrap_or_else(|_| resources::observed_replicas(workload));
        let port = self
            .registry
            .get(&resource.resource_type)
            .map(|definition| definition.port);
        let pods = self
            .cluster
            .list_pods(&namespace, &resources::pod_selector(resource))
            .await?;

        let info = resources::connection_info(
            workload,
            &pods,
            desired,
            resources::service_host(&name, &namespace, &self.cluster_domain),
            port,
        );
        let status = info.derived_status();

        if resource.status == status && resource.observed_connection_info().as_ref() == Some(&info)
        {
            return Ok(EventOutcome::Unchanged);
        }

        if resource.status != status {
            info!(
                "{} is now {} ({}/{} {} replicas ready)",
                resource.name, status, info.ready_replicas, info.total_replicas, WORKLOAD_KIND
            );
        }
        self.store
            .update_connection_info(resource.id, &info, status)
            .await?;
        Ok(EventOutcome::Updated)
    }
}

fn is_failed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == POD_FAILED_PHASE)
}

fn failure_reason(pod: &Pod) -> String {
    let status = pod.status.as_ref();
    let reason = status.and_then(|s| s.reason.as_deref());
    let message = status.and_then(|s| s.message.as_deref());
    match (reason, message) {
        (Some(reason), Some(message)) => format!("{reason}: {message}"),
        (Some(text), None) | (None, Some(text)) => text.to_string(),
        (None, None) => "no reason reported".to_string(),
    }
}

/// Name of the StatefulSet that owns the pod, if any
fn workload_owner(pod: &Pod) -> Option<String> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.kind == WORKLOAD_KIND)
        .map(|owner| owner.name.clone())
}
