//! Task launcher - Launch/cancel view of the lifecycle engine

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LaunchRequest, LaunchSupport};
use crate::core::{DeploymentId, LaunchState};
use crate::error::DeployerError;

/// Status of a launched task, in the engine's own states
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: DeploymentId,
    pub state: LaunchState,
    /// Reserved for task metadata, currently always empty
    pub attributes: BTreeMap<String, String>,
}

/// Launch-oriented API
pub trait TaskLauncher {
    /// Launch a bundle, blocking until it has started, finished or failed
    fn launch(&self, request: LaunchRequest) -> Result<DeploymentId, DeployerError>;

    fn cancel(&self, id: &DeploymentId);

    /// `None` when nothing was launched under `id`
    fn status(&self, id: &DeploymentId) -> Option<TaskStatus>;

    /// Does nothing; launched tasks leave nothing behind to clean up
    fn cleanup(&self, id: &DeploymentId);

    /// Cancel the task and forget it
    fn destroy(&self, id: &DeploymentId);
}

/// Launcher that runs bundles inside this process
pub struct ThinTaskLauncher {
    support: Arc<LaunchSupport>,
}

impl ThinTaskLauncher {
    pub fn new(support: Arc<LaunchSupport>) -> Self {
        Self { support }
    }

    pub fn support(&self) -> &Arc<LaunchSupport> {
        &self.support
    }

    /// [`TaskLauncher::launch`] on the blocking pool
    pub async fn launch_async(&self, request: LaunchRequest) -> Result<DeploymentId, DeployerError> {
        let launcher = self.clone();
        tokio::task::spawn_blocking(move || launcher.launch(request)).await?
    }
}

impl TaskLauncher for ThinTaskLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<DeploymentId, DeployerError> {
        self.support.deploy(&request)
    }

    fn cancel(&self, id: &DeploymentId) {
        self.support.cancel(id);
    }

    fn status(&self, id: &DeploymentId) -> Option<TaskStatus> {
        let record = self.support.record(id)?;
        Some(TaskStatus {
            id: id.clone(),
            state: self.support.engine().state(&record),
            attributes: BTreeMap::new(),
        })
    }

    fn cleanup(&self, id: &DeploymentId) {
        debug!("Cleanup of {} requested, nothing to do", id.short());
    }

    fn destroy(&self, id: &DeploymentId) {
        if self.support.evict(id).is_none() {
            debug!("Destroy of unknown task {} ignored", id.short());
        }
    }
}

impl Clone for ThinTaskLauncher {
    fn clone(&self) -> Self {
        Self {
            support: Arc::clone(&self.support),
        }
    }
}
