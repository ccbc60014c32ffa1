//! Domain types shared by the store, the reconciler and the event handler

pub mod job;
pub mod resource;

pub use job::{AuditEntry, JobLog, JobStatus, JobType, ProvisioningJob};
pub use resource::{
    ClusterIdentity, ConnectionInfo, LifecycleMode, PodAddress, Resource, ResourceConfig,
    ResourceStatus,
};
