//! Stateful provisioner: a reconciliation controller for databases and caches
//!
//! Desired state lives in Postgres; this crate keeps one Kubernetes
//! StatefulSet per managed resource in sync with it, reflects cluster events
//! back into the database and retries failures with exponential backoff.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod model;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use crate::error::{Error, Result};
