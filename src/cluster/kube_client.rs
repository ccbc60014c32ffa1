//! kube-rs implementation of [`ClusterClient`]

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{
    Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, WatchEvent,
    WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

use super::{
    ClusterClient, ClusterEvent, EventStream, EventType, ObjectKind, ObservedObject,
};
use crate::config::ClusterConnection;
use crate::controller::resources::{MANAGED_BY_LABEL, MANAGER_NAME};
use crate::error::{Error, Result};

/// Server-side watch timeout; must stay below the API server's 295s cap
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Build a client for the selected credential source and verify it can reach
/// the API server.
pub async fn connect(connection: &ClusterConnection) -> Result<KubeClusterClient> {
    let config = match connection {
        ClusterConnection::InCluster => kube::Config::incluster().map_err(|e| {
            Error::ConfigError(format!("in-cluster credentials unavailable: {e}"))
        })?,
        ClusterConnection::Kubeconfig(Some(path)) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::ConfigError(format!("failed to read {}: {e}", path.display()))
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::ConfigError(format!("invalid kubeconfig: {e}")))?
        }
        ClusterConnection::Kubeconfig(None) => kube::Config::infer()
            .await
            .map_err(|e| Error::ConfigError(format!("failed to infer kubeconfig: {e}")))?,
    };

    let client = Client::try_from(config)?;
    let version = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes cluster (server version {}.{}, mode {:?})",
        version.major, version.minor, connection
    );
    Ok(KubeClusterClient::new(client))
}

#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn workloads(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate one raw watch item; bookmarks are dropped
fn translate<K>(
    item: kube::Result<WatchEvent<K>>,
    namespace: &str,
    wrap: fn(K) -> ObservedObject,
) -> Option<Result<ClusterEvent>> {
    let (event_type, object) = match item {
        Ok(WatchEvent::Added(obj)) => (EventType::Added, obj),
        Ok(WatchEvent::Modified(obj)) => (EventType::Modified, obj),
        Ok(WatchEvent::Deleted(obj)) => (EventType::Deleted, obj),
        Ok(WatchEvent::Bookmark(_)) => return None,
        Ok(WatchEvent::Error(resp)) => {
            return Some(Err(Error::WatchError(format!(
                "{} (code {})",
                resp.message, resp.code
            ))))
        }
        Err(e) => return Some(Err(Error::KubeError(e))),
    };
    Some(Ok(ClusterEvent {
        event_type,
        namespace: namespace.to_string(),
        object: wrap(object),
    }))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_namespaces(&self, prefix: &str) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        let mut names: Vec<String> = list
            .items
            .iter()
            .map(|ns| ns.name_any())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            return Ok(());
        }

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGER_NAME.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &namespace).await.map_err(Error::from) {
            Ok(_) => {
                info!("Created namespace {}", name);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("Namespace {} created concurrently", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.workloads(namespace).get_opt(name).await?)
    }

    #[instrument(skip(self, workload), fields(name = %workload.name_any()))]
    async fn create_workload(&self, workload: &StatefulSet) -> Result<()> {
        let namespace = workload
            .namespace()
            .ok_or_else(|| Error::ClusterError("workload has no namespace".to_string()))?;
        let params = PostParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..Default::default()
        };
        self.workloads(&namespace).create(&params, workload).await?;
        info!("Created StatefulSet {}/{}", namespace, workload.name_any());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn scale_workload(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.workloads(namespace)
            .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
            .await?;
        info!("Scaled StatefulSet {}/{} to {}", namespace, name, replicas);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .workloads(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Deleted StatefulSet {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("StatefulSet {}/{} already gone", namespace, name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn watch(&self, namespace: &str, kind: ObjectKind) -> Result<EventStream> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let ns = namespace.to_string();

        let stream = match kind {
            ObjectKind::Workload => self
                .workloads(namespace)
                .watch(&params, "0")
                .await?
                .filter_map(move |item| {
                    future::ready(translate(item, &ns, |w| ObservedObject::Workload(Box::new(w))))
                })
                .boxed(),
            ObjectKind::Pod => self
                .pods(namespace)
                .watch(&params, "0")
                .await?
                .filter_map(move |item| {
                    future::ready(translate(item, &ns, |p| ObservedObject::Pod(Box::new(p))))
                })
                .boxed(),
        };
        Ok(stream)
    }
}
