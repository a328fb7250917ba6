//! thinhost - Run many isolated application bundles inside one host process
//!
//! Bundles are deployed into their own isolation contexts and tracked through
//! a small lifecycle state machine, so they can be deployed and torn down
//! repeatedly without starting new processes.

pub mod bundle;
pub mod core;
pub mod error;
pub mod facade;
pub mod isolation;
pub mod platform;
pub mod runner;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::bundle::{BundleRef, BundleResolver, EntryPoint, ManifestResolver, ResourceLocation};
pub use crate::core::{DeployerSettings, DeploymentId, InstanceRecord, LaunchState};
pub use crate::facade::{
    AppDeployer, AppStatus, DeploymentState, LaunchRequest, LaunchSupport, TaskLauncher,
    TaskStatus, ThinAppDeployer, ThinTaskLauncher,
};
pub use crate::isolation::{ApplicationCatalog, ContextHandle};
pub use crate::runner::{Application, Properties, Startup};

/// Library name constant
pub const APP_NAME: &str = "thinhost";

/// Library version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the logging system
///
/// Honors `RUST_LOG`. Returns false when a global subscriber was already set.
pub fn init_logging() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("thinhost=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
