//! Deployment identity - Fingerprints derived from bundle locations

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bundle::BundleRef;
use crate::error::DeployerError;

/// Deterministic key for a bundle location
///
/// The same absolute path always yields the same identity, independent of
/// what the bundle contains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(String);

impl DeploymentId {
    pub fn for_bundle(bundle: &BundleRef) -> Result<Self, DeployerError> {
        let path = bundle
            .absolute_path()
            .ok_or_else(|| DeployerError::InvalidBundle(bundle.path().to_path_buf()))?;
        let digest = Sha256::digest(path.as_os_str().as_encoded_bytes());
        Ok(Self(hex::encode(digest)))
    }

    /// Wrap an identity previously handed out to a caller
    pub fn from_hex(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, for log lines and thread names
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let direct = BundleRef::new(dir.path());
        let dotted = BundleRef::new(dir.path().join(".").join(""));

        let a = DeploymentId::for_bundle(&direct).unwrap();
        let b = DeploymentId::for_bundle(&dotted).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn different_paths_differ() {
        let a = DeploymentId::for_bundle(&BundleRef::new("/srv/bundles/a")).unwrap();
        let b = DeploymentId::for_bundle(&BundleRef::new("/srv/bundles/b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(matches!(
            DeploymentId::for_bundle(&BundleRef::new("")),
            Err(DeployerError::InvalidBundle(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_keep_distinct_identities() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let a = BundleRef::new(OsStr::from_bytes(b"/srv/bundles/\xff"));
        let b = BundleRef::new(OsStr::from_bytes(b"/srv/bundles/\xfe"));
        assert_ne!(
            DeploymentId::for_bundle(&a).unwrap(),
            DeploymentId::for_bundle(&b).unwrap()
        );
    }
}
