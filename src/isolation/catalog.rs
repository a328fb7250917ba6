//! Application catalog - Entry points the host makes visible to its contexts

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::runner::{Application, Startup};

/// Builds a running application from inside an isolation context
pub type ApplicationFactory =
    Arc<dyn Fn(&Startup<'_>) -> anyhow::Result<Box<dyn Application>> + Send + Sync>;

/// Read-only table of entry points, owned by the host boundary
#[derive(Clone, Default)]
pub struct ApplicationCatalog {
    entries: BTreeMap<String, ApplicationFactory>,
}

impl ApplicationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point under a name, replacing any previous one
    pub fn register<F>(&mut self, entry_point: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Startup<'_>) -> anyhow::Result<Box<dyn Application>> + Send + Sync + 'static,
    {
        self.entries.insert(entry_point.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, entry_point: &str) -> Option<ApplicationFactory> {
        self.entries.get(entry_point).cloned()
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.entries.contains_key(entry_point)
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ApplicationCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}
