//! Global statics - Process-wide state that outlives isolation contexts
//!
//! Some state is installed once per process by whatever bundle gets there
//! first (a URL handler factory) or accumulates registrations made as a side
//! effect of loading a library (a driver registry). Neither is scoped to a
//! context, so the coordinator resets the former before each launch and
//! purges the latter after each release.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, info};

use super::ContextId;
use crate::error::{StaticsError, TeardownError};

/// Set-once factory for custom URL scheme handlers
pub const STREAM_HANDLER_FACTORY: &str = "url.stream-handler-factory";

/// Registry that database drivers add themselves to when loaded
pub const DRIVER_REGISTRY: &str = "sql.drivers";

type SharedValue = Arc<dyn Any + Send + Sync>;

struct Installed {
    owner: ContextId,
    value: SharedValue,
}

#[derive(Default)]
struct SlotState {
    installed: Option<Installed>,
    generation: u64,
}

/// A process-wide singleton that can be set only while empty
pub struct SingletonSlot {
    name: String,
    state: Mutex<SlotState>,
}

impl SingletonSlot {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SlotState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, SlotState>, StaticsError> {
        self.state
            .lock()
            .map_err(|_| StaticsError::Poisoned("singleton slot"))
    }

    /// Install a value on behalf of a context, failing if one is already set
    pub fn install<T: Any + Send + Sync>(
        &self,
        owner: ContextId,
        value: T,
    ) -> Result<u64, StaticsError> {
        let mut state = self.lock()?;
        if let Some(existing) = &state.installed {
            return Err(StaticsError::AlreadyInstalled {
                slot: self.name.clone(),
                owner: existing.owner,
            });
        }
        state.installed = Some(Installed {
            owner,
            value: Arc::new(value),
        });
        state.generation += 1;
        Ok(state.generation)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let state = self.lock().ok()?;
        state
            .installed
            .as_ref()
            .and_then(|i| Arc::clone(&i.value).downcast::<T>().ok())
    }

    pub fn owner(&self) -> Option<ContextId> {
        self.lock().ok()?.installed.as_ref().map(|i| i.owner)
    }

    pub fn is_installed(&self) -> bool {
        self.owner().is_some()
    }

    /// Bumped on every install and clear
    pub fn generation(&self) -> u64 {
        self.lock().map(|s| s.generation).unwrap_or(0)
    }

    /// Empty the slot, returning the previous owner
    pub fn clear(&self) -> Result<Option<ContextId>, StaticsError> {
        let mut state = self.lock()?;
        let previous = state.installed.take().map(|i| i.owner);
        if previous.is_some() {
            state.generation += 1;
        }
        Ok(previous)
    }

    /// Empty the slot only if `owner` installed it
    pub fn clear_if_owned_by(&self, owner: ContextId) -> Result<bool, StaticsError> {
        let mut state = self.lock()?;
        if state.installed.as_ref().is_some_and(|i| i.owner == owner) {
            state.installed = None;
            state.generation += 1;
            return Ok(true);
        }
        Ok(false)
    }
}

struct RegistryEntry {
    owner: ContextId,
    key: String,
    value: SharedValue,
}

/// A process-wide registry whose entries remember which context added them
pub struct StaticRegistry {
    name: String,
    entries: Mutex<Vec<RegistryEntry>>,
}

impl StaticRegistry {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<RegistryEntry>>, StaticsError> {
        self.entries
            .lock()
            .map_err(|_| StaticsError::Poisoned("static registry"))
    }

    pub fn register<T: Any + Send + Sync>(
        &self,
        owner: ContextId,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), StaticsError> {
        self.lock()?.push(RegistryEntry {
            owner,
            key: key.into(),
            value: Arc::new(value),
        });
        Ok(())
    }

    /// Remove every entry registered under `key`
    pub fn deregister(&self, key: &str) -> Result<usize, StaticsError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|e| e.key != key);
        Ok(before - entries.len())
    }

    /// First value registered under `key`
    pub fn lookup<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.lock().ok()?;
        entries
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| Arc::clone(&e.value).downcast::<T>().ok())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .map(|entries| entries.iter().map(|e| e.key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries added by `owner`
    pub fn owned_by(&self, owner: ContextId) -> usize {
        self.lock()
            .map(|entries| entries.iter().filter(|e| e.owner == owner).count())
            .unwrap_or(0)
    }

    /// Remove every entry added by `owner`
    pub fn purge_owner(&self, owner: ContextId) -> Result<usize, StaticsError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|e| e.owner != owner);
        Ok(before - entries.len())
    }
}

/// Every process-wide slot and registry, by name
#[derive(Default)]
pub struct GlobalStatics {
    slots: Mutex<BTreeMap<String, Arc<SingletonSlot>>>,
    registries: Mutex<BTreeMap<String, Arc<StaticRegistry>>>,
    launch_lock: Mutex<()>,
}

impl GlobalStatics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The statics shared by the whole process
    pub fn process() -> Arc<GlobalStatics> {
        static PROCESS: OnceLock<Arc<GlobalStatics>> = OnceLock::new();
        Arc::clone(PROCESS.get_or_init(|| Arc::new(GlobalStatics::new())))
    }

    /// Get a slot by name, creating it on first use
    pub fn slot(&self, name: &str) -> Arc<SingletonSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(SingletonSlot::new(name))),
        )
    }

    /// Get a slot only if something has already touched it
    pub fn existing_slot(&self, name: &str) -> Option<Arc<SingletonSlot>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(name).cloned()
    }

    /// Get a registry by name, creating it on first use
    pub fn registry(&self, name: &str) -> Arc<StaticRegistry> {
        let mut registries = self.registries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            registries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(StaticRegistry::new(name))),
        )
    }

    fn all_slots(&self) -> Vec<Arc<SingletonSlot>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().cloned().collect()
    }

    fn all_registries(&self) -> Vec<Arc<StaticRegistry>> {
        let registries = self.registries.lock().unwrap_or_else(PoisonError::into_inner);
        registries.values().cloned().collect()
    }

    /// Total entries across every registry
    pub fn registry_entries(&self) -> usize {
        self.all_registries().iter().map(|r| r.len()).sum()
    }

    /// Number of slots currently holding a value
    pub fn installed_slots(&self) -> usize {
        self.all_slots().iter().filter(|s| s.is_installed()).count()
    }

    /// How many slot values and registry entries `owner` still holds
    pub fn held_by(&self, owner: ContextId) -> usize {
        let slots = self
            .all_slots()
            .iter()
            .filter(|s| s.owner() == Some(owner))
            .count();
        let entries: usize = self.all_registries().iter().map(|r| r.owned_by(owner)).sum();
        slots + entries
    }
}

/// What a post-release purge removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub cleared_slots: usize,
    pub deregistered: usize,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.cleared_slots == 0 && self.deregistered == 0
    }
}

/// Held for the duration of one launch, from reset until startup settles
pub struct LaunchEpoch<'a> {
    _lock: MutexGuard<'a, ()>,
    reset: usize,
}

impl LaunchEpoch<'_> {
    /// Number of slots emptied on entry
    pub fn reset_count(&self) -> usize {
        self.reset
    }
}

/// Resets and purges process-wide state around context lifetimes
pub struct StaticStateCoordinator {
    globals: Arc<GlobalStatics>,
    reset_slots: Vec<String>,
}

impl StaticStateCoordinator {
    pub fn new(globals: Arc<GlobalStatics>, reset_slots: Vec<String>) -> Self {
        Self {
            globals,
            reset_slots,
        }
    }

    pub fn globals(&self) -> &Arc<GlobalStatics> {
        &self.globals
    }

    /// Serialize against other launches and reset the configured slots
    pub fn begin_launch(&self) -> LaunchEpoch<'_> {
        let lock = self
            .globals
            .launch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let reset = self.reset();
        LaunchEpoch { _lock: lock, reset }
    }

    /// Empty every configured slot a previous context may have installed
    pub fn reset(&self) -> usize {
        let mut reset = 0;
        for name in &self.reset_slots {
            // A slot nobody has touched is not visible yet.
            let Some(slot) = self.globals.existing_slot(name) else {
                continue;
            };
            match slot.clear() {
                Ok(Some(owner)) => {
                    debug!("Reset slot '{}' installed by context {}", name, owner);
                    reset += 1;
                }
                Ok(None) => {}
                Err(e) => debug!("Cannot reset slot '{}': {}", name, e),
            }
        }
        reset
    }

    /// Drop everything process-wide that still refers to a released context
    pub fn purge(&self, context: ContextId) -> Result<PurgeReport, TeardownError> {
        let mut report = PurgeReport::default();
        let mut failures = Vec::new();

        for slot in self.globals.all_slots() {
            match slot.clear_if_owned_by(context) {
                Ok(true) => report.cleared_slots += 1,
                Ok(false) => {}
                Err(e) => failures.push(format!("{}: {}", slot.name(), e)),
            }
        }
        for registry in self.globals.all_registries() {
            match registry.purge_owner(context) {
                Ok(n) => report.deregistered += n,
                Err(e) => failures.push(format!("{}: {}", registry.name(), e)),
            }
        }

        if !report.is_empty() {
            info!(
                "Purged context {}: {} slot(s) cleared, {} registration(s) removed",
                context, report.cleared_slots, report.deregistered
            );
        }
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(TeardownError::Purge(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_set_once_until_cleared() {
        let globals = GlobalStatics::new();
        let slot = globals.slot(STREAM_HANDLER_FACTORY);
        let first = ContextId::new();
        let second = ContextId::new();

        assert_eq!(slot.install(first, "tomcat").unwrap(), 1);
        let err = slot.install(second, "jetty").unwrap_err();
        assert!(matches!(err, StaticsError::AlreadyInstalled { owner, .. } if owner == first));
        assert_eq!(slot.get::<&str>().as_deref(), Some(&"tomcat"));

        assert_eq!(slot.clear().unwrap(), Some(first));
        assert_eq!(slot.install(second, "jetty").unwrap(), 3);
        assert_eq!(slot.owner(), Some(second));
    }

    #[test]
    fn reset_only_touches_configured_slots() {
        let globals = Arc::new(GlobalStatics::new());
        let owner = ContextId::new();
        globals.slot(STREAM_HANDLER_FACTORY).install(owner, 1u8).unwrap();
        globals.slot("host.logger").install(owner, 2u8).unwrap();

        let coordinator = StaticStateCoordinator::new(
            Arc::clone(&globals),
            vec![STREAM_HANDLER_FACTORY.to_string(), "never.touched".to_string()],
        );
        assert_eq!(coordinator.reset(), 1);
        assert!(!globals.slot(STREAM_HANDLER_FACTORY).is_installed());
        assert!(globals.slot("host.logger").is_installed());
        assert!(globals.existing_slot("never.touched").is_none());
    }

    #[test]
    fn begin_launch_resets_and_reports() {
        let globals = Arc::new(GlobalStatics::new());
        globals
            .slot(STREAM_HANDLER_FACTORY)
            .install(ContextId::new(), ())
            .unwrap();
        let coordinator = StaticStateCoordinator::new(
            Arc::clone(&globals),
            vec![STREAM_HANDLER_FACTORY.to_string()],
        );

        let epoch = coordinator.begin_launch();
        assert_eq!(epoch.reset_count(), 1);
        drop(epoch);
        assert_eq!(coordinator.begin_launch().reset_count(), 0);
    }

    #[test]
    fn purge_removes_only_the_released_context() {
        let globals = Arc::new(GlobalStatics::new());
        let released = ContextId::new();
        let survivor = ContextId::new();
        let drivers = globals.registry(DRIVER_REGISTRY);
        drivers.register(released, "h2", 1u32).unwrap();
        drivers.register(released, "hsqldb", 2u32).unwrap();
        drivers.register(survivor, "postgres", 3u32).unwrap();
        globals.slot(STREAM_HANDLER_FACTORY).install(released, ()).unwrap();

        let coordinator = StaticStateCoordinator::new(Arc::clone(&globals), vec![]);
        let report = coordinator.purge(released).unwrap();

        assert_eq!(
            report,
            PurgeReport {
                cleared_slots: 1,
                deregistered: 2
            }
        );
        assert_eq!(drivers.keys(), vec!["postgres".to_string()]);
        assert_eq!(globals.held_by(released), 0);
        assert_eq!(globals.held_by(survivor), 1);
        assert!(coordinator.purge(released).unwrap().is_empty());
    }

    #[test]
    fn registry_lookup_and_deregister() {
        let registry = StaticRegistry::new(DRIVER_REGISTRY);
        let owner = ContextId::new();
        registry.register(owner, "h2", String::from("org.h2.Driver")).unwrap();
        assert_eq!(
            registry.lookup::<String>("h2").as_deref().map(String::as_str),
            Some("org.h2.Driver")
        );
        assert_eq!(registry.deregister("h2").unwrap(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn process_statics_are_shared() {
        assert!(Arc::ptr_eq(&GlobalStatics::process(), &GlobalStatics::process()));
    }
}
