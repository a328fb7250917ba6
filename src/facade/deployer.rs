//! App deployer - Deploy/undeploy view of the lifecycle engine

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{LaunchRequest, LaunchSupport};
use crate::core::{DeploymentId, LaunchState};
use crate::error::DeployerError;
use crate::platform;

/// Deployment state in the deployer's vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Deploying,
    Deployed,
    Undeployed,
    Failed,
    Unknown,
}

impl From<LaunchState> for DeploymentState {
    fn from(state: LaunchState) -> Self {
        match state {
            LaunchState::Running => Self::Deployed,
            LaunchState::Failed => Self::Failed,
            LaunchState::Cancelled => Self::Undeployed,
            _ => Self::Unknown,
        }
    }
}

/// Status of one running copy of an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: String,
    pub state: DeploymentState,
    /// Reserved for instance metadata, currently always empty
    pub attributes: BTreeMap<String, String>,
}

/// Status of a deployment and its instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatus {
    pub deployment_id: DeploymentId,
    pub state: DeploymentState,
    pub instances: Vec<InstanceStatus>,
}

impl AppStatus {
    fn unknown(id: &DeploymentId) -> Self {
        Self {
            deployment_id: id.clone(),
            state: DeploymentState::Unknown,
            instances: Vec::new(),
        }
    }
}

/// Deploy-oriented API
pub trait AppDeployer {
    /// Deploy a bundle, blocking until it has started or failed to start
    fn deploy(&self, request: LaunchRequest) -> Result<DeploymentId, DeployerError>;

    fn undeploy(&self, id: &DeploymentId);

    fn status(&self, id: &DeploymentId) -> AppStatus;
}

/// Deployer that runs bundles inside this process
pub struct ThinAppDeployer {
    support: Arc<LaunchSupport>,
}

impl ThinAppDeployer {
    pub fn new(support: Arc<LaunchSupport>) -> Self {
        Self { support }
    }

    pub fn support(&self) -> &Arc<LaunchSupport> {
        &self.support
    }

    /// Pin a listening port when the request leaves it open
    fn with_server_port(&self, mut request: LaunchRequest) -> LaunchRequest {
        let settings = self.support.settings();
        if request.properties.contains_key(&settings.server_port_key) {
            return request;
        }
        match platform::find_available_tcp_port(settings.default_server_port) {
            Some(port) => {
                info!("Assigning port {} to '{}'", port, request.app_name);
                request
                    .properties
                    .insert(settings.server_port_key.clone(), port.to_string());
            }
            None => warn!(
                "No free port at or above {} for '{}'",
                settings.default_server_port, request.app_name
            ),
        }
        request
    }

    /// [`AppDeployer::deploy`] on the blocking pool
    pub async fn deploy_async(&self, request: LaunchRequest) -> Result<DeploymentId, DeployerError> {
        let deployer = self.clone();
        tokio::task::spawn_blocking(move || deployer.deploy(request)).await?
    }

    /// [`AppDeployer::undeploy`] on the blocking pool
    pub async fn undeploy_async(&self, id: DeploymentId) -> Result<(), DeployerError> {
        let deployer = self.clone();
        tokio::task::spawn_blocking(move || deployer.undeploy(&id)).await?;
        Ok(())
    }
}

impl AppDeployer for ThinAppDeployer {
    fn deploy(&self, request: LaunchRequest) -> Result<DeploymentId, DeployerError> {
        let request = self.with_server_port(request);
        self.support.deploy(&request)
    }

    fn undeploy(&self, id: &DeploymentId) {
        self.support.cancel(id);
    }

    fn status(&self, id: &DeploymentId) -> AppStatus {
        let Some(record) = self.support.record(id) else {
            return AppStatus::unknown(id);
        };
        let state = DeploymentState::from(self.support.engine().state(&record));
        let instance_id = record
            .status()
            .map(|s| s.instance_id.to_string())
            .unwrap_or_else(|| id.to_string());

        AppStatus {
            deployment_id: id.clone(),
            state,
            instances: vec![InstanceStatus {
                id: instance_id,
                state,
                attributes: BTreeMap::new(),
            }],
        }
    }
}

impl Clone for ThinAppDeployer {
    fn clone(&self) -> Self {
        Self {
            support: Arc::clone(&self.support),
        }
    }
}
