//! Manifest resolver - Resolves exploded bundle directories from TOML manifests
//!
//! A bundle is a directory laid out as:
//!
//! ```text
//! <bundle>/bundle.toml             packaging metadata, may declare `entry-point`
//! <bundle>/<name>.toml             dependency manifest for a name
//! <bundle>/<name>-<profile>.toml   per-profile overlay, applied in profile order
//! <bundle>/bin/<candidate>.entry   compiled entry points, scanned when none is declared
//! ```
//!
//! Dependency entries are paths, relative ones resolved against the bundle root.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, trace};

use super::{BundleRef, BundleResolver, EntryPoint, ResourceLocation};
use crate::error::ResolveError;

/// Packaging metadata file name
const METADATA_FILE: &str = "bundle.toml";

/// Directory scanned for entry point candidates
const ENTRY_DIR: &str = "bin";

/// Extension of entry point marker artifacts
const ENTRY_EXTENSION: &str = "entry";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PackageMetadata {
    #[serde(default)]
    entry_point: Option<String>,
}

/// Dependency manifest or profile overlay
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundleManifest {
    /// Dependency locations, in load order
    #[serde(default)]
    pub dependencies: Vec<PathBuf>,
    /// Locations removed from the final dependency list
    #[serde(default)]
    pub exclusions: Vec<PathBuf>,
}

/// Resolver for bundles that are plain directories on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct ManifestResolver {
    host_resources: Option<Vec<ResourceLocation>>,
}

impl ManifestResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed host resource set instead of the executable's directory
    pub fn with_host_resources(mut self, resources: Vec<ResourceLocation>) -> Self {
        self.host_resources = Some(resources);
        self
    }

    fn bundle_root(bundle: &BundleRef) -> Result<PathBuf, ResolveError> {
        let root = bundle
            .absolute_path()
            .unwrap_or_else(|| bundle.path().to_path_buf());
        if !root.is_dir() {
            return Err(ResolveError::NotADirectory { path: root });
        }
        Ok(root)
    }

    fn read_toml<T: for<'de> Deserialize<'de>>(
        path: &Path,
    ) -> Result<Option<T>, ResolveError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|source| ResolveError::ManifestRead {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = toml::from_str(&text).map_err(|source| ResolveError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(parsed))
    }

    fn scan_entry_points(root: &Path) -> Result<Vec<String>, ResolveError> {
        let dir = root.join(ENTRY_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|source| ResolveError::Scan {
            path: dir.clone(),
            source,
        })?;

        let mut candidates = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ResolveError::Scan {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                candidates.push(stem.to_string());
            }
        }
        candidates.sort();
        Ok(candidates)
    }
}

impl BundleResolver for ManifestResolver {
    fn resolve_dependencies(
        &self,
        bundle: &BundleRef,
        name: &str,
        profiles: &[String],
    ) -> Result<Vec<ResourceLocation>, ResolveError> {
        let root = Self::bundle_root(bundle)?;

        let mut manifests = Vec::new();
        if let Some(base) = Self::read_toml::<BundleManifest>(&root.join(format!("{name}.toml")))? {
            manifests.push(base);
        }
        for profile in profiles {
            let overlay = root.join(format!("{name}-{profile}.toml"));
            match Self::read_toml::<BundleManifest>(&overlay)? {
                Some(manifest) => manifests.push(manifest),
                None => trace!("No overlay for profile '{}' in {:?}", profile, root),
            }
        }

        let excluded: HashSet<PathBuf> = manifests
            .iter()
            .flat_map(|m| m.exclusions.iter())
            .map(|p| root.join(p))
            .collect();

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for dependency in manifests.iter().flat_map(|m| m.dependencies.iter()) {
            let path = root.join(dependency);
            if excluded.contains(&path) || !seen.insert(path.clone()) {
                continue;
            }
            if !path.exists() {
                return Err(ResolveError::MissingDependency {
                    bundle: root,
                    dependency: path,
                });
            }
            resolved.push(ResourceLocation::new(path));
        }

        debug!(
            "Resolved {} dependencies for {:?} (name '{}', profiles {:?})",
            resolved.len(),
            root,
            name,
            profiles
        );
        Ok(resolved)
    }

    fn find_main_entry_point(&self, bundle: &BundleRef) -> Result<EntryPoint, ResolveError> {
        let root = Self::bundle_root(bundle)?;

        let metadata = Self::read_toml::<PackageMetadata>(&root.join(METADATA_FILE))?;
        if let Some(declared) = metadata.and_then(|m| m.entry_point) {
            return Ok(EntryPoint::new(declared));
        }

        let mut candidates = Self::scan_entry_points(&root)?;
        match candidates.len() {
            0 => Err(ResolveError::NoEntryPoint { bundle: root }),
            1 => Ok(EntryPoint::new(candidates.remove(0))),
            _ => Err(ResolveError::AmbiguousEntryPoint {
                bundle: root,
                candidates,
            }),
        }
    }

    fn host_resources(&self) -> Result<Vec<ResourceLocation>, ResolveError> {
        match &self.host_resources {
            Some(resources) => Ok(resources.clone()),
            None => super::executable_resources(),
        }
    }
}
