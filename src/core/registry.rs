//! Deployment registry - Deduplicates deployments by identity

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::identity::DeploymentId;
use super::record::InstanceRecord;

/// Map from deployment identity to its one instance record
#[derive(Default)]
pub struct DeploymentRegistry {
    records: Mutex<HashMap<DeploymentId, Arc<InstanceRecord>>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeploymentId, Arc<InstanceRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the record for `id`, building it with `create` if there is none
    ///
    /// An existing record is returned unchanged; whatever `create` would have
    /// built differently is ignored. Concurrent callers for the same new
    /// identity all receive the single record that won.
    pub fn find_or_create<F>(&self, id: &DeploymentId, create: F) -> (Arc<InstanceRecord>, bool)
    where
        F: FnOnce() -> InstanceRecord,
    {
        let mut records = self.lock();
        if let Some(existing) = records.get(id) {
            debug!("Reusing record {}", id.short());
            return (Arc::clone(existing), false);
        }
        let record = Arc::new(create());
        records.insert(id.clone(), Arc::clone(&record));
        info!("Registered deployment {} for {}", id.short(), record.bundle());
        (record, true)
    }

    pub fn find(&self, id: &DeploymentId) -> Option<Arc<InstanceRecord>> {
        self.lock().get(id).cloned()
    }

    /// Remove a record that has nothing attached
    ///
    /// A record with a live context or runner, or one that another thread is
    /// launching or cancelling, stays registered. Cancel it first.
    pub fn remove(&self, id: &DeploymentId) -> Option<Arc<InstanceRecord>> {
        let mut records = self.lock();
        let detached = records
            .get(id)?
            .try_attachment()
            .is_some_and(|a| !a.is_attached());
        if !detached {
            warn!("Deployment {} is still attached, not removed", id.short());
            return None;
        }
        let removed = records.remove(id);
        info!("Removed deployment {}", id.short());
        removed
    }

    /// Remove a record whatever it holds
    ///
    /// The caller owns the teardown; see `LifecycleEngine::retire`.
    pub(crate) fn take(&self, id: &DeploymentId) -> Option<Arc<InstanceRecord>> {
        let removed = self.lock().remove(id);
        if removed.is_some() {
            info!("Took deployment {} out of the registry", id.short());
        }
        removed
    }

    pub fn ids(&self) -> Vec<DeploymentId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn records(&self) -> Vec<Arc<InstanceRecord>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
