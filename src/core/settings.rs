//! Deployer settings management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bundle::ResourceLocation;
use crate::error::SettingsError;
use crate::isolation::statics::STREAM_HANDLER_FACTORY;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerSettings {
    // Naming
    /// Manifest name used when a request does not pick one
    pub default_name: String,
    /// Profiles used when a request does not pick any
    pub default_profiles: Vec<String>,
    /// Deployment group used when a request does not pick one
    pub default_group: String,

    // Networking
    /// Property that pins an application's listening port
    pub server_port_key: String,
    /// Lowest port tried when one has to be picked
    pub default_server_port: u16,

    // Isolation
    /// Process-wide singleton slots cleared before every launch
    pub reset_slots: Vec<String>,
    /// Name prefix of startup worker threads
    pub worker_thread_prefix: String,
    /// Host resources shared by every context (defaults to the executable's directory)
    pub host_resources: Option<Vec<PathBuf>>,

    // Reclamation
    /// Warn when more contexts than this are still reachable
    pub leak_warning_threshold: usize,
    /// Hint the allocator to return memory after each teardown
    pub request_reclamation: bool,
}

impl Default for DeployerSettings {
    fn default() -> Self {
        Self {
            // Naming
            default_name: "thin".to_string(),
            default_profiles: Vec::new(),
            default_group: "deployer".to_string(),

            // Networking
            server_port_key: "server.port".to_string(),
            default_server_port: 8080,

            // Isolation
            reset_slots: vec![STREAM_HANDLER_FACTORY.to_string()],
            worker_thread_prefix: "bundle-launcher".to_string(),
            host_resources: None,

            // Reclamation
            leak_warning_threshold: 32,
            request_reclamation: true,
        }
    }
}

impl DeployerSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Self =
            serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate();
        debug!("Loaded deployer settings from {:?}", path);
        Ok(settings)
    }

    /// Load from the user's config directory, falling back to defaults
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            warn!("Ignoring settings file: {}", e);
            Self::default()
        })
    }

    /// Where `load_or_default` looks for a settings file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("thinhost").join("settings.json"))
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        if self.default_name.trim().is_empty() {
            self.default_name = "thin".to_string();
        }
        if self.default_group.trim().is_empty() {
            self.default_group = "deployer".to_string();
        }
        if self.server_port_key.trim().is_empty() {
            self.server_port_key = "server.port".to_string();
        }
        if self.worker_thread_prefix.trim().is_empty() {
            self.worker_thread_prefix = "bundle-launcher".to_string();
        }
        self.default_server_port = self.default_server_port.max(1024);
        self.leak_warning_threshold = self.leak_warning_threshold.max(1);
        self.default_profiles.retain(|p| !p.trim().is_empty());
    }

    /// Host resources as resource locations, if pinned
    pub fn host_resource_locations(&self) -> Option<Vec<ResourceLocation>> {
        self.host_resources
            .as_ref()
            .map(|paths| paths.iter().cloned().map(ResourceLocation::new).collect())
    }
}
