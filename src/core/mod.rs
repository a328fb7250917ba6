//! Core module - Deployment records, registry, lifecycle engine and host monitoring

mod engine;
mod identity;
mod monitor;
mod record;
mod registry;
pub mod settings;
mod state;

pub use engine::LifecycleEngine;
pub use identity::DeploymentId;
pub use monitor::{format_bytes, HostMonitor, HostSnapshot, SharedHostMonitor};
pub use record::{InstanceRecord, RecordDetails, RecordSnapshot, StatusHandle};
pub use registry::DeploymentRegistry;
pub use settings::DeployerSettings;
pub use state::LaunchState;
