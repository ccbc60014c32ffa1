//! Kubernetes object builders for managed resources
//!
//! Each resource becomes one StatefulSet. This module builds its desired
//! object and derives connection info from what the cluster reports.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    PodSpec, PodTemplateSpec, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use super::registry::TypeDefinition;
use crate::model::{ConnectionInfo, PodAddress, Resource, ResourceConfig};

/// Value of the managed-by label and field manager for every write
pub const MANAGER_NAME: &str = "provisioner-controller";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const RESOURCE_ID_LABEL: &str = "provisioner.io/resource-id";

const DATA_VOLUME: &str = "data";
const MAX_NAME_LEN: usize = 63;

/// DNS-1123 compliant object name derived from the resource name
pub fn workload_name(resource: &Resource) -> String {
    let mut name: String = resource
        .name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(MAX_NAME_LEN);
    let name = name.trim_matches('-');
    if name.is_empty() {
        format!("res-{}", &resource.id.simple().to_string()[..8])
    } else {
        name.to_string()
    }
}

/// Namespace and object name the resource's workload lives under
pub fn cluster_target(resource: &Resource) -> (String, String) {
    let namespace = resource
        .k8s_namespace
        .clone()
        .unwrap_or_else(|| resource.namespace.clone());
    let name = resource
        .k8s_resource_name
        .clone()
        .unwrap_or_else(|| workload_name(resource));
    (namespace, name)
}

/// Labels put on the workload and its pods
pub fn standard_labels(resource: &Resource) -> BTreeMap<String, String> {
    let mut labels = selector_labels(resource);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    labels
}

fn selector_labels(resource: &Resource) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(NAME_LABEL.to_string(), workload_name(resource));
    labels.insert(RESOURCE_ID_LABEL.to_string(), resource.id.to_string());
    labels
}

/// Label selector string matching the resource's pods
pub fn pod_selector(resource: &Resource) -> String {
    format!("{}={}", RESOURCE_ID_LABEL, resource.id)
}

/// In-cluster DNS name of the resource's service
pub fn service_host(name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{name}.{namespace}.svc.{cluster_domain}")
}

/// Build the desired StatefulSet for a resource
pub fn build_workload(
    resource: &Resource,
    definition: &TypeDefinition,
    config: &ResourceConfig,
) -> StatefulSet {
    let (namespace, name) = cluster_target(resource);
    let labels = standard_labels(resource);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(config.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(resource)),
                ..Default::default()
            },
            service_name: name,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![build_container(resource, definition, config)],
                    ..Default::default()
                }),
            },
            volume_claim_templates: config
                .storage
                .as_ref()
                .map(|size| vec![build_volume_claim(size)]),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_container(
    resource: &Resource,
    definition: &TypeDefinition,
    config: &ResourceConfig,
) -> Container {
    // Resource-level env wins over type defaults
    let mut env = definition.env.clone();
    env.extend(config.env.clone());
    let env: Vec<EnvVar> = env
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();

    let volume_mounts = match (&config.storage, &definition.data_path) {
        (Some(_), Some(path)) => Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: path.clone(),
            ..Default::default()
        }]),
        _ => None,
    };

    Container {
        name: resource.resource_type.to_lowercase(),
        image: Some(definition.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("service".to_string()),
            container_port: definition.port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: if env.is_empty() { None } else { Some(env) },
        volume_mounts,
        ..Default::default()
    }
}

fn build_volume_claim(size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Replica count the workload currently asks for
pub fn observed_replicas(workload: &StatefulSet) -> i32 {
    workload
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

pub fn ready_replicas(workload: &StatefulSet) -> i32 {
    workload
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

fn pod_address(pod: &Pod) -> PodAddress {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    PodAddress {
        name: pod.name_any(),
        ip: status.and_then(|s| s.pod_ip.clone()),
        phase: status.and_then(|s| s.phase.clone()),
        ready,
    }
}

/// Connection info for a workload and its pods, with `total_replicas` as the
/// number of replicas that must be ready for the resource to be active.
pub fn connection_info(
    workload: &StatefulSet,
    pods: &[Pod],
    total_replicas: i32,
    service: String,
    port: Option<i32>,
) -> ConnectionInfo {
    let mut pods: Vec<PodAddress> = pods.iter().map(pod_address).collect();
    pods.sort_by(|a, b| a.name.cmp(&b.name));

    ConnectionInfo {
        pods,
        ready_replicas: ready_replicas(workload),
        total_replicas,
        service: Some(service),
        port,
        error: None,
    }
}
