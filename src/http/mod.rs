//! Health and metrics HTTP endpoints
//!
//! Two independent listeners: `/healthz` and `/readyz` on the health port,
//! `/metrics` on the metrics port.

mod handlers;
mod server;

pub use server::{bind, health_router, metrics_router, serve};
