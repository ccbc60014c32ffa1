//! Controller lifecycle
//!
//! [`Controller::start`] spawns the watch streams, the event loop, the worker
//! pool and the periodic reconcile loop onto one task tracker.
//! [`Controller::stop`] cancels the shared token and joins every task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::EventHandler;
use super::locks::ResourceLocks;
use super::metrics;
use super::queue::WorkQueue;
use super::reconciler::Reconciler;
use super::registry::TypeRegistry;
use super::retry::{RetryPolicy, RetryQueue};
use super::watcher::Watcher;
use crate::cluster::{ClusterClient, ClusterEvent};
use crate::config::Config;
use crate::error::Result;
use crate::store::ResourceStore;

/// Runtime tunables taken from [`Config`]
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub namespace_prefix: String,
    pub cluster_domain: String,
    pub reconcile_interval: Duration,
    pub worker_count: usize,
    pub retry: RetryPolicy,
    pub watch_retry_delay: Duration,
    pub event_buffer_size: usize,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        let reconcile = &config.reconcile;
        Self {
            namespace_prefix: config.cluster.namespace_prefix.clone(),
            cluster_domain: config.cluster.cluster_domain.clone(),
            reconcile_interval: reconcile.reconcile_interval,
            worker_count: reconcile.worker_count,
            retry: RetryPolicy {
                base: reconcile.retry_backoff_base,
                max: reconcile.retry_backoff_max,
                max_retries: reconcile.max_retries,
            },
            watch_retry_delay: reconcile.watch_retry_delay,
            event_buffer_size: reconcile.event_buffer_size,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace_prefix: "team-".to_string(),
            cluster_domain: "cluster.local".to_string(),
            reconcile_interval: Duration::from_secs(30),
            worker_count: 5,
            retry: RetryPolicy::default(),
            watch_retry_delay: Duration::from_secs(5),
            event_buffer_size: 1000,
        }
    }
}

/// State shared by every spawned loop
struct Shared {
    store: Arc<dyn ResourceStore>,
    reconciler: Reconciler,
    events: EventHandler,
    retry: RetryQueue,
    locks: Arc<ResourceLocks>,
    shutdown: CancellationToken,
}

pub struct Controller {
    settings: ControllerSettings,
    cluster: Arc<dyn ClusterClient>,
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl Controller {
    pub fn new(
        settings: ControllerSettings,
        store: Arc<dyn ResourceStore>,
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        let locks = Arc::new(ResourceLocks::new());
        let reconciler = Reconciler::new(
            store.clone(),
            cluster.clone(),
            registry.clone(),
            settings.cluster_domain.clone(),
        );
        let events = EventHandler::new(
            store.clone(),
            cluster.clone(),
            registry,
            locks.clone(),
            settings.cluster_domain.clone(),
        );

        Self {
            shared: Arc::new(Shared {
                store,
                reconciler,
                events,
                retry: RetryQueue::new(settings.retry),
                locks,
                shutdown: CancellationToken::new(),
            }),
            settings,
            cluster,
            tracker: TaskTracker::new(),
        }
    }

    /// Token cancelled by [`Controller::stop`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Resources currently backing off
    pub fn pending_retries(&self) -> usize {
        self.shared.retry.len()
    }

    /// Start every background loop. Fails only when the initial namespace
    /// discovery fails; nothing is left running in that case.
    pub async fn start(&self) -> Result<()> {
        let settings = &self.settings;
        info!(
            "Starting controller: {} workers, reconcile every {:?}, namespace prefix '{}'",
            settings.worker_count, settings.reconcile_interval, settings.namespace_prefix
        );

        let (event_tx, event_rx) = mpsc::channel(settings.event_buffer_size.max(1));
        let watcher = Arc::new(Watcher::new(
            self.cluster.clone(),
            settings.namespace_prefix.clone(),
            settings.watch_retry_delay,
            event_tx,
            self.tracker.clone(),
            self.shared.shutdown.clone(),
        ));
        if let Err(e) = watcher.start().await {
            self.shared.shutdown.cancel();
            self.tracker.close();
            self.tracker.wait().await;
            return Err(e);
        }

        let worker_count = settings.worker_count.max(1);
        let queue = Arc::new(WorkQueue::new(worker_count * 2));
        for worker in 0..worker_count {
            self.tracker
                .spawn(run_worker(self.shared.clone(), queue.clone(), worker));
        }

        self.tracker
            .spawn(run_event_loop(self.shared.clone(), event_rx));
        self.tracker.spawn(run_periodic_loop(
            self.shared.clone(),
            watcher,
            queue,
            settings.reconcile_interval,
        ));

        Ok(())
    }

    /// Cancel every loop and wait for all of them to exit
    pub async fn stop(&self) {
        info!("Stopping controller");
        self.shared.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Controller stopped");
    }
}

async fn run_worker(shared: Arc<Shared>, queue: Arc<WorkQueue>, worker: usize) {
    debug!("Worker {} started", worker);
    while let Some(id) = queue.next(&shared.shutdown).await {
        shared.process(id).await;
        queue.done(id);
    }
    debug!("Worker {} stopped", worker);
}

async fn run_event_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<ClusterEvent>) {
    loop {
        let event = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match shared.events.handle(&event).await {
            Ok(outcome) => metrics::inc_event_update(outcome.as_str()),
            Err(e) => {
                warn!(
                    "Failed to handle {} event for {}/{}: {}",
                    event.object.kind(),
                    event.namespace,
                    event.object.name(),
                    e
                );
                metrics::inc_event_update("error");
            }
        }
    }
    debug!("Event loop stopped");
}

async fn run_periodic_loop(
    shared: Arc<Shared>,
    watcher: Arc<Watcher>,
    queue: Arc<WorkQueue>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => shared.reconcile_all(&watcher, &queue).await,
        }
    }
    debug!("Periodic reconcile loop stopped");
}

impl Shared {
    async fn reconcile_all(&self, watcher: &Watcher, queue: &WorkQueue) {
        match watcher.sync_namespaces().await {
            Ok(0) => {}
            Ok(added) => info!("Watching {} new namespace(s)", added),
            Err(e) => warn!("Namespace discovery failed: {}", e),
        }
        self.locks.prune();

        let mut resources = match self.store.list_managed().await {
            Ok(resources) => resources,
            Err(e) => {
                error!("Failed to load managed resources: {}", e);
                return;
            }
        };
        metrics::MANAGED_RESOURCES.set(resources.len() as i64);
        match self.store.list_pending_deletions().await {
            Ok(pending) => resources.extend(pending),
            Err(e) => error!("Failed to load pending deletions: {}", e),
        }

        let mut queued = 0;
        for resource in &resources {
            if self.retry.should_skip(resource.id) {
                metrics::RECONCILE_SKIPPED_TOTAL.inc();
                continue;
            }
            if queue.enqueue(resource.id, &self.shutdown).await {
                queued += 1;
            } else if self.shutdown.is_cancelled() {
                return;
            }
        }
        debug!(
            "Periodic pass queued {} of {} resource(s)",
            queued,
            resources.len()
        );
    }

    async fn process(&self, id: Uuid) {
        let _guard = self.locks.acquire(id).await;

        let resource = match self.store.get_resource(id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                debug!("Resource {} disappeared before reconciliation", id);
                self.retry.remove(id);
                return;
            }
            Err(e) => {
                warn!("Failed to load resource {}: {}", id, e);
                metrics::inc_reconcile_error(e.kind());
                self.retry.add(id);
                return;
            }
        };

        let started = Instant::now();
        let result = self.reconciler.reconcile_resource(&resource).await;
        metrics::observe_reconcile(started.elapsed(), result.is_ok());

        match result {
            Ok(()) => {
                if self.retry.remove(id) {
                    info!("{} reconciled after earlier failures", resource.name);
                }
            }
            Err(e) => {
                metrics::inc_reconcile_error(e.kind());
                let entry = self.retry.add(id);
                if self.retry.exhausted(&entry) {
                    error!(
                        "{} ({}) keeps failing after {} attempts: {}",
                        resource.name, id, entry.retry_count, e
                    );
                } else {
                    warn!(
                        "Reconciliation of {} failed (attempt {}): {}",
                        resource.name, entry.retry_count, e
                    );
                }
            }
        }
        metrics::RETRY_QUEUE_DEPTH.set(self.retry.len() as i64);
    }
}
