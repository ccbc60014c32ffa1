use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::controller::metrics;

/// OpenMetrics text exposition content type
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Process liveness only
pub async fn healthz() -> &'static str {
    "ok"
}

/// Always ready; no dependency is checked
pub async fn readyz() -> &'static str {
    "ready"
}

pub async fn metrics() -> Response {
    match metrics::render() {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}
