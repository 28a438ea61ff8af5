//! Lifecycle orchestrator
//!
//! [`LifecycleManager`] wires the secret manager, secure cache, permission
//! registry, rotation manager and monitoring into the public API consumed by
//! application modules. Build one with [`LifecycleManager::builder`] and pass
//! it to every consumer; there is no global instance.

mod builder;
mod manager;
mod report;

pub use builder::LifecycleBuilder;
pub use manager::LifecycleManager;
pub use report::{LifecycleReport, MonitoringSummary};
