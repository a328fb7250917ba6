//! Bundles - References, resource locations and dependency resolution

mod manifest;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

pub use manifest::{BundleManifest, ManifestResolver};

/// Location of a packaged application on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleRef(PathBuf);

impl BundleRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Absolute form of the bundle path, canonical when the bundle exists
    pub fn absolute_path(&self) -> Option<PathBuf> {
        if self.0.as_os_str().is_empty() {
            return None;
        }
        std::fs::canonicalize(&self.0)
            .or_else(|_| std::path::absolute(&self.0))
            .ok()
    }
}

impl std::fmt::Display for BundleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// One element of the ordered resource sequence an isolation context loads from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLocation(PathBuf);

impl ResourceLocation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Name of an application's main entry point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPoint(String);

impl EntryPoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns a bundle reference into what an isolation context needs to run it
pub trait BundleResolver: Send + Sync {
    /// Ordered dependency locations for the bundle under a name and profile set
    fn resolve_dependencies(
        &self,
        bundle: &BundleRef,
        name: &str,
        profiles: &[String],
    ) -> Result<Vec<ResourceLocation>, ResolveError>;

    /// The application's main entry point
    ///
    /// Fails when the bundle declares none and scanning finds zero or more
    /// than one candidate.
    fn find_main_entry_point(&self, bundle: &BundleRef) -> Result<EntryPoint, ResolveError>;

    /// Resources of the host itself, shared read-only by every context
    fn host_resources(&self) -> Result<Vec<ResourceLocation>, ResolveError> {
        executable_resources()
    }
}

/// The directory holding the running executable
pub(crate) fn executable_resources() -> Result<Vec<ResourceLocation>, ResolveError> {
    let exe = std::env::current_exe().map_err(ResolveError::HostResources)?;
    let root = exe.parent().map(Path::to_path_buf).unwrap_or(exe);
    Ok(vec![ResourceLocation::new(root)])
}
