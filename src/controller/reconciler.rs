//! Per-resource convergence
//!
//! [`Reconciler::reconcile_resource`] drives one resource's cluster state
//! toward the desired state in its database row. Failures are recorded on
//! the row, the job and the audit log before being returned, so the caller
//! only uses the error to schedule a retry.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::TypeRegistry;
use super::resources;
use crate::cluster::{ClusterClient, WORKLOAD_KIND};
use crate::error::{Error, Result};
use crate::model::{
    AuditEntry, ClusterIdentity, JobLog, JobType, Resource, ResourceStatus,
};
use crate::store::ResourceStore;

pub const ACTION_CREATED: &str = "resource.created";
pub const ACTION_CREATE_FAILED: &str = "resource.create_failed";
pub const ACTION_SCALED: &str = "resource.scaled";
pub const ACTION_UPDATE_FAILED: &str = "resource.update_failed";
pub const ACTION_DELETED: &str = "resource.deleted";
pub const ACTION_DELETE_FAILED: &str = "resource.delete_failed";

pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<TypeRegistry>,
    cluster_domain: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<TypeRegistry>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cluster,
            registry,
            cluster_domain: cluster_domain.into(),
        }
    }

    /// Converge one resource
    #[instrument(skip(self, resource), fields(resource_id = %resource.id, name = %resource.name))]
    pub async fn reconcile_resource(&self, resource: &Resource) -> Result<()> {
        if !resource.is_managed() {
            debug!(
                "Skipping {} (lifecycle mode {})",
                resource.name, resource.lifecycle_mode
            );
            return Ok(());
        }

        if resource.is_deleted() {
            return self.delete(resource).await;
        }

        let (namespace, name) = resources::cluster_target(resource);
        let observed = match self.cluster.get_workload(&namespace, &name).await {
            Ok(observed) => observed,
            Err(e) => {
                self.record_failure(resource, None, ACTION_UPDATE_FAILED, &e, JobLog::default())
                    .await;
                return Err(e);
            }
        };

        match observed {
            None => self.create(resource).await,
            Some(workload) => self.update(resource, &workload).await,
        }
    }

    async fn create(&self, resource: &Resource) -> Result<()> {
        info!(
            "Provisioning {} ({}) in namespace {}",
            resource.name, resource.resource_type, resource.namespace
        );
        self.store
            .update_status(resource.id, ResourceStatus::Provisioning)
            .await?;
        let job = self.store.open_job(resource.id, JobType::Create).await?;

        let mut log = JobLog::default();
        match self.provision(resource, &mut log).await {
            Ok(identity) => {
                log.push("resource is active");
                self.store.complete_job(job, &log.render()).await?;
                self.audit(
                    resource,
                    ACTION_CREATED,
                    json!({
                        "namespace": identity.namespace,
                        "name": identity.name,
                        "kind": identity.kind,
                        "resource_type": resource.resource_type,
                    }),
                )
                .await;
                info!(
                    "Provisioned {} as {}/{}",
                    resource.name, identity.namespace, identity.name
                );
                Ok(())
            }
            Err(e) => {
                log.push(format!("failed: {e}"));
                self.record_failure(resource, Some(job), ACTION_CREATE_FAILED, &e, log)
                    .await;
                Err(e)
            }
        }
    }

    async fn provision(&self, resource: &Resource, log: &mut JobLog) -> Result<ClusterIdentity> {
        let definition = self.registry.resolve(&resource.resource_type)?;
        let config = resource.desired_config()?;
        let workload = resources::build_workload(resource, definition, &config);
        let (namespace, name) = resources::cluster_target(resource);
        log.push(format!(
            "built {} {}/{} (image {}, port {}, replicas {})",
            WORKLOAD_KIND, namespace, name, definition.image, definition.port, config.replicas
        ));

        self.cluster.ensure_namespace(&namespace).await?;
        log.push(format!("namespace {namespace} ready"));

        self.cluster.create_workload(&workload).await?;
        log.push(format!("created {WORKLOAD_KIND} {namespace}/{name}"));

        let identity = ClusterIdentity {
            namespace,
            name,
            kind: WORKLOAD_KIND.to_string(),
        };
        self.store
            .record_cluster_object(resource.id, &identity)
            .await?;
        self.store
            .update_status(resource.id, ResourceStatus::Active)
            .await?;
        Ok(identity)
    }

    async fn update(&self, resource: &Resource, observed: &StatefulSet) -> Result<()> {
        match self.converge(resource, observed).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_failure(resource, None, ACTION_UPDATE_FAILED, &e, JobLog::default())
                    .await;
                Err(e)
            }
        }
    }

    async fn converge(&self, resource: &Resource, observed: &StatefulSet) -> Result<()> {
        let definition = self.registry.resolve(&resource.resource_type)?;
        let config = resource.desired_config()?;
        let desired = resources::build_workload(resource, definition, &config);
        let (namespace, name) = resources::cluster_target(resource);

        let desired_replicas = resources::observed_replicas(&desired);
        let current_replicas = resources::observed_replicas(observed);
        if desired_replicas != current_replicas {
            self.scale(resource, &namespace, &name, current_replicas, desired_replicas)
                .await?;
        }

        // Repairs a create that crashed between the cluster call and the row update
        let identity = ClusterIdentity {
            namespace: namespace.clone(),
            name: name.clone(),
            kind: WORKLOAD_KIND.to_string(),
        };
        if resource.k8s_namespace.as_deref() != Some(identity.namespace.as_str())
            || resource.k8s_resource_name.as_deref() != Some(identity.name.as_str())
            || resource.k8s_resource_type.as_deref() != Some(WORKLOAD_KIND)
        {
            warn!(
                "Recording missing cluster identity {}/{} for {}",
                namespace, name, resource.name
            );
            self.store
                .record_cluster_object(resource.id, &identity)
                .await?;
        }

        let pods = self
            .cluster
            .list_pods(&namespace, &resources::pod_selector(resource))
            .await?;
        let info = resources::connection_info(
            observed,
            &pods,
            desired_replicas,
            resources::service_host(&name, &namespace, &self.cluster_domain),
            Some(definition.port),
        );
        let status = info.derived_status();
        debug!(
            "{} has {}/{} ready replicas, status {}",
            resource.name, info.ready_replicas, info.total_replicas, status
        );
        self.store
            .update_connection_info(resource.id, &info, status)
            .await
    }

    async fn scale(
        &self,
        resource: &Resource,
        namespace: &str,
        name: &str,
        from: i32,
        to: i32,
    ) -> Result<()> {
        info!("Scaling {}/{} from {} to {} replicas", namespace, name, from, to);
        let job = self.store.open_job(resource.id, JobType::Scale).await?;
        let mut log = JobLog::default();

        if let Err(e) = self.cluster.scale_workload(namespace, name, to).await {
            log.push(format!("scale {from} -> {to} failed: {e}"));
            if let Err(store_err) = self
                .store
                .fail_job(job, &log.render(), &e.to_string())
                .await
            {
                error!("Failed to close scale job {}: {}", job, store_err);
            }
            return Err(e);
        }

        log.push(format!("scaled {namespace}/{name} from {from} to {to} replicas"));
        self.store.complete_job(job, &log.render()).await?;
        self.audit(
            resource,
            ACTION_SCALED,
            json!({ "namespace": namespace, "name": name, "from": from, "to": to }),
        )
        .await;
        Ok(())
    }

    async fn delete(&self, resource: &Resource) -> Result<()> {
        let (namespace, name) = resources::cluster_target(resource);

        match self.cluster.delete_workload(&namespace, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("{}/{} already removed", namespace, name);
            }
            Err(e) => {
                self.record_failure(resource, None, ACTION_DELETE_FAILED, &e, JobLog::default())
                    .await;
                return Err(e);
            }
        }

        if resource.status == ResourceStatus::Deleted {
            return Ok(());
        }

        self.store
            .update_status(resource.id, ResourceStatus::Deleted)
            .await?;
        self.audit(
            resource,
            ACTION_DELETED,
            json!({ "namespace": namespace, "name": name }),
        )
        .await;
        info!("Removed {} from {}/{}", resource.name, namespace, name);
        Ok(())
    }

    /// Persist a failure on the row, the open job and the audit log. Store
    /// errors here are logged; the original error is what the caller returns.
    async fn record_failure(
        &self,
        resource: &Resource,
        job: Option<Uuid>,
        action: &str,
        err: &Error,
        log: JobLog,
    ) {
        let message = err.to_string();
        warn!("Reconciliation of {} failed: {}", resource.name, message);

        if let Err(e) = self.store.mark_error(resource.id, &message).await {
            error!("Failed to mark {} as error: {}", resource.id, e);
        }
        if let Some(job) = job {
            if let Err(e) = self.store.fail_job(job, &log.render(), &message).await {
                error!("Failed to close job {}: {}", job, e);
            }
        }
        self.audit(
            resource,
            action,
            json!({ "error": message, "retriable": err.is_retriable() }),
        )
        .await;
    }

    async fn audit(&self, resource: &Resource, action: &str, details: serde_json::Value) {
        let entry = AuditEntry::new(action, resource.team_id, resource.id, details);
        if let Err(e) = self.store.append_audit(&entry).await {
            error!("Failed to write audit log {} for {}: {}", action, resource.id, e);
        }
    }
}
