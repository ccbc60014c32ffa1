//! Desired-state store
//!
//! The relational database is the single source of truth. The controller
//! reads `resources` and writes back status, connection info and the
//! cluster identity of each workload, and appends to `provisioning_jobs`
//! and `audit_logs`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{AuditEntry, ClusterIdentity, ConnectionInfo, JobType, Resource, ResourceStatus};

mod postgres;

pub use postgres::{connect, PgStore};

/// Database operations the controller depends on
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// `lifecycle_mode = 'full' AND deleted_at IS NULL`
    async fn list_managed(&self) -> Result<Vec<Resource>>;

    /// Soft-deleted `full` resources whose cluster object has not been removed yet
    async fn list_pending_deletions(&self) -> Result<Vec<Resource>>;

    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>>;

    /// Look a resource up by the cluster object recorded for it
    async fn find_by_cluster_object(&self, namespace: &str, name: &str)
        -> Result<Option<Resource>>;

    async fn update_status(&self, id: Uuid, status: ResourceStatus) -> Result<()>;

    /// Set status `error` and store `message` under `connection_info.error`
    async fn mark_error(&self, id: Uuid, message: &str) -> Result<()>;

    async fn record_cluster_object(&self, id: Uuid, identity: &ClusterIdentity) -> Result<()>;

    /// Replace connection info and status in one write
    async fn update_connection_info(
        &self,
        id: Uuid,
        info: &ConnectionInfo,
        status: ResourceStatus,
    ) -> Result<()>;

    /// Open a `running` job and return its id
    async fn open_job(&self, resource_id: Uuid, job_type: JobType) -> Result<Uuid>;

    async fn complete_job(&self, job_id: Uuid, logs: &str) -> Result<()>;

    async fn fail_job(&self, job_id: Uuid, logs: &str, error: &str) -> Result<()>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
}
