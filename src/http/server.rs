//! Axum listeners for the health and metrics endpoints

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::{Error, Result};

pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .layer(TraceLayer::new_for_http())
}

pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
}

/// Bind the listener for the `name` endpoint on all interfaces
pub async fn bind(name: &str, port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind {} server to {}: {}", name, addr, e)))
}

/// Serve `app` on `listener` until `shutdown` fires, then drain in-flight requests
pub async fn serve(
    name: &str,
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("{} server listening on {}", name, addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::ConfigError(format!("{} server error: {}", name, e)))?;

    info!("{} server stopped", name);
    Ok(())
}
