//! Prometheus metrics for the provisioning controller
//!
//! # Exported metrics
//! - `provisioner_reconcile_duration_seconds` (histogram): reconcile duration labeled by result.
//! - `provisioner_reconcile_errors_total` (counter): reconcile errors labeled by error kind.
//! - `provisioner_reconcile_skipped_total` (counter): resources skipped while backing off.
//! - `provisioner_retry_queue_depth` (gauge): resources currently tracked for retry.
//! - `provisioner_managed_resources` (gauge): resources loaded by the last periodic pass.
//! - `provisioner_watch_events_total` (counter): watch events labeled by object kind and event type.
//! - `provisioner_watch_reconnects_total` (counter): watch stream reopenings labeled by object kind.
//! - `provisioner_event_updates_total` (counter): event-driven status writes labeled by outcome.

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    /// "success" or "error"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error category, see `Error::kind`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatchLabels {
    pub object_kind: String,
    pub event_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StreamLabels {
    pub object_kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "updated", "unchanged", "ignored" or "error"
    pub outcome: String,
}

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ResultLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_SKIPPED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static RETRY_QUEUE_DEPTH: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static MANAGED_RESOURCES: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static WATCH_EVENTS_TOTAL: Lazy<Family<WatchLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WATCH_RECONNECTS_TOTAL: Lazy<Family<StreamLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static EVENT_UPDATES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "provisioner_reconcile_duration_seconds",
        "Duration of single-resource reconciliations in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "provisioner_reconcile_errors",
        "Total number of failed reconciliations",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "provisioner_reconcile_skipped",
        "Reconciliations skipped because the resource was backing off",
        RECONCILE_SKIPPED_TOTAL.clone(),
    );
    registry.register(
        "provisioner_retry_queue_depth",
        "Resources currently tracked in the retry queue",
        RETRY_QUEUE_DEPTH.clone(),
    );
    registry.register(
        "provisioner_managed_resources",
        "Resources loaded by the most recent periodic pass",
        MANAGED_RESOURCES.clone(),
    );
    registry.register(
        "provisioner_watch_events",
        "Watch events received from the cluster",
        WATCH_EVENTS_TOTAL.clone(),
    );
    registry.register(
        "provisioner_watch_reconnects",
        "Times a watch stream was reopened",
        WATCH_RECONNECTS_TOTAL.clone(),
    );
    registry.register(
        "provisioner_event_updates",
        "Status writes triggered by watch events",
        EVENT_UPDATES_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile(elapsed: Duration, success: bool) {
    let result = if success { "success" } else { "error" };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ResultLabels {
            result: result.to_string(),
        })
        .observe(elapsed.as_secs_f64());
}

pub fn inc_reconcile_error(kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_watch_event(object_kind: &str, event_type: &str) {
    WATCH_EVENTS_TOTAL
        .get_or_create(&WatchLabels {
            object_kind: object_kind.to_string(),
            event_type: event_type.to_string(),
        })
        .inc();
}

pub fn inc_watch_reconnect(object_kind: &str) {
    WATCH_RECONNECTS_TOTAL
        .get_or_create(&StreamLabels {
            object_kind: object_kind.to_string(),
        })
        .inc();
}

pub fn inc_event_update(outcome: &str) {
    EVENT_UPDATES_TOTAL
        .get_or_create(&OutcomeLabels {
            outcome: outcome.to_string(),
        })
        .inc();
}

/// Render the registry in OpenMetrics text format
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_families() {
        observe_reconcile(Duration::from_millis(12), true);
        inc_reconcile_error("kube");
        inc_watch_event("pod", "added");
        RETRY_QUEUE_DEPTH.set(2);

        let text = render().unwrap();
        assert!(text.contains("provisioner_reconcile_duration_seconds"));
        assert!(text.contains("provisioner_reconcile_errors_total{kind=\"kube\"}"));
        assert!(text.contains("provisioner_watch_events_total"));
        assert!(text.contains("provisioner_retry_queue_depth"));
        assert!(text.ends_with("# EOF\n"));
    }
}
