//! Facades - Deploy and launch APIs over one shared lifecycle engine
//!
//! [`LaunchSupport`] owns the registry and the engine. [`ThinAppDeployer`]
//! and [`ThinTaskLauncher`] are cheap, cloneable views over it that translate
//! requests and states into their own vocabulary.

mod deployer;
mod launcher;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bundle::{BundleRef, BundleResolver, ManifestResolver};
use crate::core::{
    DeployerSettings, DeploymentId, DeploymentRegistry, HostSnapshot, InstanceRecord,
    LaunchState, LifecycleEngine, RecordSnapshot, SharedHostMonitor, StatusHandle,
};
use crate::error::DeployerError;
use crate::isolation::statics::GlobalStatics;
use crate::isolation::{ApplicationCatalog, HostBoundary};
use crate::runner::Properties;

pub use deployer::{AppDeployer, AppStatus, DeploymentState, InstanceStatus, ThinAppDeployer};
pub use launcher::{TaskLauncher, TaskStatus, ThinTaskLauncher};

/// Deployment property overriding the manifest name
pub const THIN_NAME_KEY: &str = "deployer.thin.name";

/// Deployment property overriding the profiles, comma-separated
pub const THIN_PROFILE_KEY: &str = "deployer.thin.profile";

/// Deployment property carrying the logical group
pub const GROUP_KEY: &str = "deployer.group";

/// Management namespace, unique per group and application
pub const MANAGEMENT_NAMESPACE_KEY: &str = "management.namespace";

pub const MANAGEMENT_UNIQUE_NAMES_KEY: &str = "management.unique-names";

pub const MANAGEMENT_SHUTDOWN_KEY: &str = "management.shutdown.enabled";

pub const APPLICATION_GROUP_KEY: &str = "application.group";

/// What a caller asks to deploy or launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub bundle: BundleRef,
    /// Logical application name, used in the management namespace
    pub app_name: String,
    /// Configuration overrides for the application
    #[serde(default)]
    pub properties: Properties,
    /// Positional arguments, `--key=value` entries override properties
    #[serde(default)]
    pub args: Vec<String>,
    /// Settings for the deployer itself: name, profiles, group
    #[serde(default)]
    pub deployment_properties: Properties,
}

impl LaunchRequest {
    pub fn new(app_name: impl Into<String>, bundle: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bundle: BundleRef::new(bundle),
            app_name: app_name.into(),
            properties: Properties::new(),
            args: Vec::new(),
            deployment_properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_deployment_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.deployment_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_group(self, group: impl Into<String>) -> Self {
        self.with_deployment_property(GROUP_KEY, group)
    }

    pub fn with_manifest_name(self, name: impl Into<String>) -> Self {
        self.with_deployment_property(THIN_NAME_KEY, name)
    }

    pub fn with_profiles(self, profiles: &[&str]) -> Self {
        self.with_deployment_property(THIN_PROFILE_KEY, profiles.join(","))
    }
}

/// Registry, engine and settings shared by both facades
pub struct LaunchSupport {
    registry: DeploymentRegistry,
    engine: LifecycleEngine,
    settings: DeployerSettings,
    monitor: SharedHostMonitor,
}

impl LaunchSupport {
    pub fn builder(catalog: ApplicationCatalog) -> LaunchSupportBuilder {
        LaunchSupportBuilder::new(catalog)
    }

    pub fn settings(&self) -> &DeployerSettings {
        &self.settings
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    pub fn registry(&self) -> &DeploymentRegistry {
        &self.registry
    }

    pub fn host(&self) -> &Arc<HostBoundary> {
        self.engine.host()
    }

    /// Find or register the request's deployment, then launch it
    ///
    /// Blocks until the application has started or failed. A deployment that
    /// is still attached is left alone, whatever the new request says.
    pub fn deploy(&self, request: &LaunchRequest) -> Result<DeploymentId, DeployerError> {
        let id = DeploymentId::for_bundle(&request.bundle)?;
        let properties = self.launch_properties(request);
        loop {
            let (record, created) = self.registry.find_or_create(&id, || {
                InstanceRecord::new(
                    id.clone(),
                    request.bundle.clone(),
                    self.manifest_name(request),
                    self.profiles(request),
                )
            });
            if created {
                record.assign_status(StatusHandle::new(
                    id.clone(),
                    request.deployment_properties.clone(),
                ));
            }

            let state = self.engine.launch(&record, &properties, &request.args);
            if record.is_retired() && state == LaunchState::Unknown {
                // Evicted between lookup and launch; the next lookup registers afresh.
                debug!("Deployment {} was evicted, registering it again", id.short());
                continue;
            }
            debug!("Deploy of {} returned in state {}", id.short(), state);
            return Ok(id);
        }
    }

    /// Application properties plus the derived management properties
    pub fn launch_properties(&self, request: &LaunchRequest) -> Properties {
        let group = request
            .deployment_properties
            .get(GROUP_KEY)
            .cloned()
            .unwrap_or_else(|| self.settings.default_group.clone());

        let mut properties = request.properties.clone();
        properties.insert(
            MANAGEMENT_NAMESPACE_KEY.to_string(),
            format!("{}.{}", group, request.app_name),
        );
        properties.insert(MANAGEMENT_UNIQUE_NAMES_KEY.to_string(), "true".to_string());
        properties.insert(MANAGEMENT_SHUTDOWN_KEY.to_string(), "true".to_string());
        properties.insert(APPLICATION_GROUP_KEY.to_string(), group);
        properties
    }

    fn manifest_name(&self, request: &LaunchRequest) -> String {
        request
            .deployment_properties
            .get(THIN_NAME_KEY)
            .cloned()
            .unwrap_or_else(|| self.settings.default_name.clone())
    }

    fn profiles(&self, request: &LaunchRequest) -> Vec<String> {
        match request.deployment_properties.get(THIN_PROFILE_KEY) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            None => self.settings.default_profiles.clone(),
        }
    }

    pub fn record(&self, id: &DeploymentId) -> Option<Arc<InstanceRecord>> {
        self.registry.find(id)
    }

    /// Current state, `Unknown` when there is no such deployment
    pub fn state(&self, id: &DeploymentId) -> LaunchState {
        self.registry
            .find(id)
            .map(|record| self.engine.state(&record))
            .unwrap_or(LaunchState::Unknown)
    }

    /// Cancel a deployment. Unknown identities are ignored.
    pub fn cancel(&self, id: &DeploymentId) -> LaunchState {
        match self.registry.find(id) {
            Some(record) => self.engine.cancel(&record),
            None => {
                debug!("Cancel of unknown deployment {} ignored", id.short());
                LaunchState::Unknown
            }
        }
    }

    /// Cancel a deployment and forget it
    ///
    /// The record leaves the registry before it is cancelled, so a concurrent
    /// deploy of the same bundle either lands on a fresh record or is torn
    /// down here.
    pub fn evict(&self, id: &DeploymentId) -> Option<LaunchState> {
        let record = self.registry.take(id)?;
        Some(self.engine.retire(&record))
    }

    pub fn ids(&self) -> Vec<DeploymentId> {
        self.registry.ids()
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        let mut snapshots: Vec<_> = self
            .registry
            .records()
            .iter()
            .map(|r| r.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Sample host memory and leftover static state
    pub fn host_snapshot(&self) -> Option<HostSnapshot> {
        self.monitor.sample()
    }

    /// Cancel every deployment, keeping the records for status queries
    pub fn shutdown(&self) {
        let records = self.registry.records();
        info!("Shutting down {} deployment(s)", records.len());
        let stopped = records
            .iter()
            .filter(|record| self.engine.cancel(record).is_terminal())
            .count();
        debug!("{} deployment(s) stopped", stopped);
        if let Some(snapshot) = self.host_snapshot() {
            info!(
                "After shutdown: {} live context(s), {} slot(s), {} registry entries, memory {}",
                snapshot.live_contexts,
                snapshot.installed_slots,
                snapshot.registry_entries,
                snapshot.memory_string()
            );
        }
    }
}

/// Builder for [`LaunchSupport`]
pub struct LaunchSupportBuilder {
    catalog: ApplicationCatalog,
    settings: DeployerSettings,
    resolver: Option<Arc<dyn BundleResolver>>,
    globals: Option<Arc<GlobalStatics>>,
}

impl LaunchSupportBuilder {
    pub fn new(catalog: ApplicationCatalog) -> Self {
        Self {
            catalog,
            settings: DeployerSettings::default(),
            resolver: None,
            globals: None,
        }
    }

    pub fn with_settings(mut self, settings: DeployerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn BundleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use private process-wide statics instead of the shared ones
    pub fn with_globals(mut self, globals: Arc<GlobalStatics>) -> Self {
        self.globals = Some(globals);
        self
    }

    pub fn build(self) -> Result<LaunchSupport, DeployerError> {
        let mut settings = self.settings;
        settings.validate();

        let pinned = settings.host_resource_locations();
        let resolver = self.resolver.unwrap_or_else(|| {
            let resolver = match &pinned {
                Some(resources) => ManifestResolver::new().with_host_resources(resources.clone()),
                None => ManifestResolver::new(),
            };
            Arc::new(resolver) as Arc<dyn BundleResolver>
        });
        let host_resources = match pinned {
            Some(resources) => resources,
            None => resolver.host_resources()?,
        };

        let globals = self.globals.unwrap_or_else(GlobalStatics::process);
        let host = Arc::new(
            HostBoundary::new(host_resources, self.catalog, globals)
                .with_worker_prefix(settings.worker_thread_prefix.clone()),
        );
        let engine = LifecycleEngine::new(resolver, host, settings.reset_slots.clone())
            .with_leak_warning_threshold(settings.leak_warning_threshold)
            .with_reclamation(settings.request_reclamation);

        info!(
            "Deployer ready (name '{}', group '{}')",
            settings.default_name, settings.default_group
        );
        let monitor = SharedHostMonitor::new(Arc::clone(engine.host()));
        Ok(LaunchSupport {
            registry: DeploymentRegistry::new(),
            engine,
            settings,
            monitor,
        })
    }
}
