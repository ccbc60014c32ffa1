//! Reconciliation controller
//!
//! Drives cluster workloads toward the desired state stored in the database,
//! reflects watch events back into resource rows and retries failures with
//! exponential backoff.

mod events;
mod locks;
mod manager;
pub mod metrics;
mod queue;
mod reconciler;
pub mod registry;
pub mod resources;
pub mod retry;
mod watcher;

pub use events::{EventHandler, EventOutcome};
pub use locks::ResourceLocks;
pub use manager::{Controller, ControllerSettings};
pub use queue::WorkQueue;
pub use reconciler::Reconciler;
pub use registry::{TypeDefinition, TypeRegistry};
pub use retry::{calculate_backoff, RetryEntry, RetryPolicy, RetryQueue};
pub use watcher::Watcher;
