//! Context-local statics - Per-context storage keyed by type

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Type-keyed storage scoped to one isolation context
///
/// Holds what a bundle would otherwise put in a process static. Dropped when
/// the owning context is released.
#[derive(Default)]
pub struct ContextStatics {
    values: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ContextStatics {
    /// Get the value of type `T`, creating it on first use
    pub fn get_or_init<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let key = TypeId::of::<T>();
        if let Some(existing) = values
            .get(&key)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
        {
            return existing;
        }
        let value = Arc::new(init());
        values.insert(key, Arc::clone(&value) as Arc<dyn Any + Send + Sync>);
        value
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values
            .get(&TypeId::of::<T>())
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.values
            .lock()
            .map(|v| v.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every value, returning how many there were
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<_> = {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            values.drain().collect()
        };
        drained.len()
    }
}
