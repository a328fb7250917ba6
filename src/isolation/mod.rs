//! Isolation contexts - Execution boundaries for launched bundles
//!
//! An [`IsolationContext`] is created per launch from an ordered set of
//! resource locations and a shared, read-only [`HostBoundary`]. Mutable
//! state that an application would otherwise keep in statics lives in the
//! context's own [`ContextStatics`], so two contexts never share it. State
//! that is genuinely process-wide goes through [`statics::GlobalStatics`],
//! where every entry is tagged with the context that installed it.

pub mod ambient;
mod catalog;
mod local;
pub mod statics;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::bundle::{EntryPoint, ResourceLocation};
use crate::error::{StartupError, TeardownError};
use crate::runner::{ApplicationRunner, ContextRunner};

pub use catalog::{ApplicationCatalog, ApplicationFactory};
pub use local::ContextStatics;
use statics::GlobalStatics;

/// Unique identifier for an isolation context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The host's own boundary, shared read-only by every context it parents
pub struct HostBoundary {
    resources: Vec<ResourceLocation>,
    catalog: ApplicationCatalog,
    globals: Arc<GlobalStatics>,
    worker_prefix: String,
    tracker: Mutex<Vec<(ContextId, Weak<ContextInner>)>>,
}

impl HostBoundary {
    pub fn new(
        resources: Vec<ResourceLocation>,
        catalog: ApplicationCatalog,
        globals: Arc<GlobalStatics>,
    ) -> Self {
        Self {
            resources,
            catalog,
            globals,
            worker_prefix: "bundle-launcher".to_string(),
            tracker: Mutex::new(Vec::new()),
        }
    }

    /// Name prefix for the worker threads that start applications
    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn resources(&self) -> &[ResourceLocation] {
        &self.resources
    }

    pub fn catalog(&self) -> &ApplicationCatalog {
        &self.catalog
    }

    pub fn globals(&self) -> &Arc<GlobalStatics> {
        &self.globals
    }

    /// Number of contexts created under this boundary that are still reachable,
    /// attached or not
    pub fn live_contexts(&self) -> usize {
        self.live_context_ids().len()
    }

    /// Identifiers of contexts that are still reachable
    pub fn live_context_ids(&self) -> Vec<ContextId> {
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.retain(|(_, weak)| weak.strong_count() > 0);
        tracker.iter().map(|(id, _)| *id).collect()
    }

    /// Released contexts that something outside them still keeps reachable
    pub fn leaked_contexts(&self) -> usize {
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.retain(|(_, weak)| weak.strong_count() > 0);
        tracker
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .filter(|inner| inner.released.load(Ordering::SeqCst))
            .count()
    }

    fn track(&self, inner: &Arc<ContextInner>) {
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.retain(|(_, weak)| weak.strong_count() > 0);
        tracker.push((inner.id, Arc::downgrade(inner)));
    }
}

impl std::fmt::Debug for HostBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBoundary")
            .field("resources", &self.resources)
            .field("catalog", &self.catalog)
            .field("worker_prefix", &self.worker_prefix)
            .finish_non_exhaustive()
    }
}

struct ContextInner {
    id: ContextId,
    resources: Vec<ResourceLocation>,
    parent: Arc<HostBoundary>,
    statics: ContextStatics,
    released: AtomicBool,
    active: AtomicUsize,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        debug!("Context {} reclaimed", self.id);
    }
}

/// Shared reference to a context, held by runners and by code running inside it
#[derive(Clone)]
pub struct ContextHandle(Arc<ContextInner>);

impl ContextHandle {
    pub fn id(&self) -> ContextId {
        self.0.id
    }

    /// Resource locations, bundle root first
    pub fn resources(&self) -> &[ResourceLocation] {
        &self.0.resources
    }

    pub fn parent(&self) -> &Arc<HostBoundary> {
        &self.0.parent
    }

    /// Context-local replacement for process statics
    pub fn statics(&self) -> &ContextStatics {
        &self.0.statics
    }

    /// Process-wide state, reached through the parent boundary
    pub fn globals(&self) -> &Arc<GlobalStatics> {
        self.0.parent.globals()
    }

    pub fn is_released(&self) -> bool {
        self.0.released.load(Ordering::SeqCst)
    }

    /// Number of threads currently executing inside this context
    pub fn active_threads(&self) -> usize {
        self.0.active.load(Ordering::SeqCst)
    }

    /// Resolve an entry point as seen from inside this context
    pub fn load(&self, entry_point: &EntryPoint) -> Result<ApplicationFactory, StartupError> {
        if self.is_released() {
            return Err(StartupError::ContextReleased(self.id()));
        }
        self.0
            .parent
            .catalog()
            .get(entry_point.as_str())
            .ok_or_else(|| StartupError::EntryPointNotFound {
                entry_point: entry_point.to_string(),
                context: self.id(),
            })
    }

    /// Weak reference that does not keep the context alive
    pub fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.0))
    }

    pub(crate) fn enter(&self) {
        self.0.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave(&self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.0.id)
            .field("resources", &self.0.resources)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Non-owning reference to a context, for reclamation checks
#[derive(Clone)]
pub struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    /// Whether anything still keeps the context reachable
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<ContextHandle> {
        self.0.upgrade().map(ContextHandle)
    }
}

/// Owning side of a context, held by exactly one instance record
#[derive(Debug)]
pub struct IsolationContext {
    handle: ContextHandle,
}

impl IsolationContext {
    /// Create a boundary over the given resources, parented by the host
    pub fn create(resources: Vec<ResourceLocation>, parent: Arc<HostBoundary>) -> Self {
        let inner = Arc::new(ContextInner {
            id: ContextId::new(),
            resources,
            parent,
            statics: ContextStatics::default(),
            released: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });
        inner.parent.track(&inner);
        debug!(
            "Created context {} over {} resource(s)",
            inner.id,
            inner.resources.len()
        );
        Self {
            handle: ContextHandle(inner),
        }
    }

    pub fn id(&self) -> ContextId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// Obtain an application runner whose code identity belongs to this context
    pub fn instantiate_runner(&self) -> Result<Box<dyn ApplicationRunner>, StartupError> {
        if self.handle.is_released() {
            return Err(StartupError::ContextReleased(self.id()));
        }
        let thread_name = format!(
            "{}-{}",
            self.handle.parent().worker_prefix,
            &self.id().0.simple().to_string()[..8]
        );
        Ok(Box::new(ContextRunner::new(self.handle.clone(), thread_name)))
    }

    /// Give the context up
    ///
    /// Context-local statics are dropped and further loads are refused. The
    /// owning reference is dropped even when an error is returned.
    pub fn release(self) -> Result<(), TeardownError> {
        let id = self.id();
        self.handle.0.released.store(true, Ordering::SeqCst);
        let cleared = self.handle.statics().clear();
        let active = self.handle.active_threads();
        debug!("Released context {} ({} local static(s) dropped)", id, cleared);
        drop(self);

        if active > 0 {
            return Err(TeardownError::ContextBusy {
                context: id,
                active,
            });
        }
        Ok(())
    }
}
