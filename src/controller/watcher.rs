//! Cluster watch supervision
//!
//! One task per (namespace, object kind) keeps a watch stream open and
//! forwards its events into the controller's event channel. A stream that
//! fails or closes is reopened after `reconnect_delay`, forever, until the
//! shutdown token fires or the namespace disappears from discovery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::metrics;
use crate::cluster::{ClusterClient, ClusterEvent, ObjectKind};
use crate::error::Result;

const WATCHED_KINDS: [ObjectKind; 2] = [ObjectKind::Workload, ObjectKind::Pod];

pub struct Watcher {
    cluster: Arc<dyn ClusterClient>,
    namespace_prefix: String,
    reconnect_delay: Duration,
    events: mpsc::Sender<ClusterEvent>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    /// Namespace → token that stops its watch tasks
    watched: Mutex<HashMap<String, CancellationToken>>,
}

impl Watcher {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace_prefix: impl Into<String>,
        reconnect_delay: Duration,
        events: mpsc::Sender<ClusterEvent>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            namespace_prefix: namespace_prefix.into(),
            reconnect_delay,
            events,
            tracker,
            shutdown,
            watched: Mutex::new(HashMap::new()),
        }
    }

    /// Discover namespaces and start watching them. A discovery failure here
    /// is returned to the caller and aborts startup.
    pub async fn start(&self) -> Result<()> {
        let started = self.sync_namespaces().await?;
        info!(
            "Watching {} namespace(s) with prefix '{}'",
            started,
            self.namespace_prefix
        );
        Ok(())
    }

    /// Start watches for namespaces that appeared since the last call and
    /// stop those for namespaces that are gone. Returns how many were added.
    pub async fn sync_namespaces(&self) -> Result<usize> {
        let namespaces: HashSet<String> = self
            .cluster
            .list_namespaces(&self.namespace_prefix)
            .await?
            .into_iter()
            .collect();

        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        watched.retain(|namespace, token| {
            let keep = namespaces.contains(namespace);
            if !keep {
                info!("Namespace {} is gone, stopping its watches", namespace);
                token.cancel();
            }
            keep
        });

        let mut added = 0;
        for namespace in namespaces {
            if watched.contains_key(&namespace) {
                continue;
            }
            let token = self.shutdown.child_token();
            self.watch_namespace(&namespace, &token);
            watched.insert(namespace, token);
            added += 1;
        }
        Ok(added)
    }

    pub fn watched_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        namespaces.sort();
        namespaces
    }

    fn watch_namespace(&self, namespace: &str, shutdown: &CancellationToken) {
        debug!("Starting watches in namespace {}", namespace);
        for kind in WATCHED_KINDS {
            let stream = WatchStream {
                cluster: self.cluster.clone(),
                namespace: namespace.to_string(),
                kind,
                reconnect_delay: self.reconnect_delay,
                events: self.events.clone(),
                shutdown: shutdown.clone(),
            };
            self.tracker.spawn(stream.run());
        }
    }
}

struct WatchStream {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    kind: ObjectKind,
    reconnect_delay: Duration,
    events: mpsc::Sender<ClusterEvent>,
    shutdown: CancellationToken,
}

impl WatchStream {
    async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            match self.cluster.watch(&self.namespace, self.kind).await {
                Ok(stream) => {
                    if !self.forward(stream).await {
                        return;
                    }
                    debug!(
                        "{} watch in {} closed, reopening",
                        self.kind, self.namespace
                    );
                }
                Err(e) => {
                    warn!(
                        "Failed to open {} watch in {}: {}",
                        self.kind, self.namespace, e
                    );
                }
            }

            metrics::inc_watch_reconnect(self.kind.as_str());
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// Forward events until the stream ends or errors. Returns false when the
    /// watch should not be reopened.
    async fn forward(&self, mut stream: crate::cluster::EventStream) -> bool {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    metrics::inc_watch_event(self.kind.as_str(), event.event_type.as_str());
                    let sent = tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        sent = self.events.send(event) => sent,
                    };
                    if sent.is_err() {
                        // receiver gone, controller is stopping
                        return false;
                    }
                }
                Some(Err(e)) => {
                    warn!("{} watch in {} failed: {}", self.kind, self.namespace, e);
                    return true;
                }
                None => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{EventType, ObservedObject};
    use crate::error::Error;
    use crate::testing::{pod, FakeCluster};

    fn pod_event(namespace: &str, name: &str) -> ClusterEvent {
        ClusterEvent {
            event_type: EventType::Added,
            namespace: namespace.to_string(),
            object: ObservedObject::Pod(Box::new(pod(namespace, name, None, "Running", true))),
        }
    }

    #[tokio::test]
    async fn test_watch_reopens_after_failure() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_namespace("team-a");
        cluster.script_watch(
            "team-a",
            ObjectKind::Pod,
            vec![Err(Error::WatchError("connection reset".into()))],
        );
        cluster.script_watch("team-a", ObjectKind::Pod, vec![Ok(pod_event("team-a", "db-0"))]);

        let (tx, mut rx) = mpsc::channel(8);
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let watcher = Watcher::new(
            cluster.clone(),
            "team-",
            Duration::from_millis(10),
            tx,
            tracker.clone(),
            token.clone(),
        );
        watcher.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive after reconnect")
            .unwrap();
        assert_eq!(event.object.name(), "db-0");
        assert!(cluster.watch_opens("team-a", ObjectKind::Pod) >= 2);

        token.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("watch tasks should stop");
    }

    #[tokio::test]
    async fn test_sync_only_adds_new_namespaces() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_namespace("team-a");
        cluster.add_namespace("kube-system");

        let (tx, _rx) = mpsc::channel(8);
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let watcher = Watcher::new(
            cluster.clone(),
            "team-",
            Duration::from_millis(10),
            tx,
            tracker.clone(),
            token.clone(),
        );

        assert_eq!(watcher.sync_namespaces().await.unwrap(), 1);
        cluster.add_namespace("team-b");
        assert_eq!(watcher.sync_namespaces().await.unwrap(), 1);
        assert_eq!(watcher.sync_namespaces().await.unwrap(), 0);
        assert_eq!(watcher.watched_namespaces(), vec!["team-a", "team-b"]);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_vanished_namespace_stops_its_watches() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_namespace("team-a");
        cluster.add_namespace("team-b");

        let (tx, _rx) = mpsc::channel(8);
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let watcher = Watcher::new(
            cluster.clone(),
            "team-",
            Duration::from_millis(10),
            tx,
            tracker.clone(),
            token.clone(),
        );
        assert_eq!(watcher.sync_namespaces().await.unwrap(), 2);

        cluster.remove_namespace("team-a");
        cluster.remove_namespace("team-b");
        assert_eq!(watcher.sync_namespaces().await.unwrap(), 0);
        assert!(watcher.watched_namespaces().is_empty());

        // streams exit without the shared shutdown token
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("watches for removed namespaces should stop");
        assert!(!token.is_cancelled());

        cluster.add_namespace("team-a");
        assert_eq!(watcher.sync_namespaces().await.unwrap(), 1);
        assert_eq!(watcher.watched_namespaces(), vec!["team-a"]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_start_fails_when_discovery_fails() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_namespace_listing(true);

        let (tx, _rx) = mpsc::channel(8);
        let watcher = Watcher::new(
            cluster,
            "team-",
            Duration::from_millis(10),
            tx,
            TaskTracker::new(),
            CancellationToken::new(),
        );
        assert!(watcher.start().await.is_err());
    }
}
