//! Desired-state resource rows and the observed state written back to them

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Which parts of a resource's lifecycle this controller owns
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMode {
    /// Create, update and delete are all driven by the controller
    #[default]
    Full,
    /// Managed elsewhere; the controller leaves it alone
    Partial,
    /// Observed only
    MonitorOnly,
}

impl LifecycleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleMode::Full => "full",
            LifecycleMode::Partial => "partial",
            LifecycleMode::MonitorOnly => "monitor_only",
        }
    }
}

impl fmt::Display for LifecycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(LifecycleMode::Full),
            "partial" => Ok(LifecycleMode::Partial),
            "monitor_only" => Ok(LifecycleMode::MonitorOnly),
            other => Err(Error::DecodeError(format!("unknown lifecycle mode '{other}'"))),
        }
    }
}

/// Resource status as stored in `resources.status`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Pending,
    Provisioning,
    Active,
    Updating,
    Error,
    Deleted,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Provisioning => "provisioning",
            ResourceStatus::Active => "active",
            ResourceStatus::Updating => "updating",
            ResourceStatus::Error => "error",
            ResourceStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ResourceStatus::Pending),
            "provisioning" => Ok(ResourceStatus::Provisioning),
            "active" => Ok(ResourceStatus::Active),
            "updating" => Ok(ResourceStatus::Updating),
            "error" => Ok(ResourceStatus::Error),
            "deleted" => Ok(ResourceStatus::Deleted),
            other => Err(Error::DecodeError(format!("unknown resource status '{other}'"))),
        }
    }
}

/// A desired stateful service instance (one row of `resources`)
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    pub team_id: Uuid,
    /// Resource type name, e.g. `postgresql`
    pub resource_type: String,
    pub lifecycle_mode: LifecycleMode,
    /// Free-form desired configuration, see [`ResourceConfig`]
    pub config: serde_json::Value,
    /// Team-scoped namespace the workload should live in
    pub namespace: String,
    pub status: ResourceStatus,
    pub k8s_namespace: Option<String>,
    pub k8s_resource_name: Option<String>,
    pub k8s_resource_type: Option<String>,
    pub connection_info: Option<serde_json::Value>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn is_managed(&self) -> bool {
        self.lifecycle_mode == LifecycleMode::Full
    }

    /// Soft-deleted by the API layer
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Parse the free-form config column
    pub fn desired_config(&self) -> Result<ResourceConfig> {
        ResourceConfig::from_value(&self.config)
    }

    /// Stored connection info, if it parses
    pub fn observed_connection_info(&self) -> Option<ConnectionInfo> {
        self.connection_info
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Typed view of `resources.config`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// PVC size such as `10Gi`; no volume claim when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    /// Extra container environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

fn default_replicas() -> i32 {
    1
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            storage: None,
            env: BTreeMap::new(),
        }
    }
}

impl ResourceConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let config: ResourceConfig = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidResourceConfig(e.to_string()))?;
        if config.replicas < 0 {
            return Err(Error::InvalidResourceConfig(format!(
                "replicas must not be negative (got {})",
                config.replicas
            )));
        }
        Ok(config)
    }
}

/// Where a resource's workload object lives in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

/// Address of one pod backing a resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAddress {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub ready: bool,
}

/// Observed connection metadata stored in `resources.connection_info`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub pods: Vec<PodAddress>,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub total_replicas: i32,
    /// In-cluster service host, e.g. `orders-db.team-a.svc.cluster.local`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionInfo {
    /// `active` once every desired replica is ready, `updating` before that
    pub fn derived_status(&self) -> ResourceStatus {
        if self.ready_replicas >= self.total_replicas {
            ResourceStatus::Active
        } else {
            ResourceStatus::Updating
        }
    }
}
