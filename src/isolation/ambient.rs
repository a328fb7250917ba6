//! Ambient context - The context a thread is currently executing inside
//!
//! Entering a context swaps it into a thread-local slot and leaving restores
//! whatever was there before. Scopes are guards, so the previous context comes
//! back on every exit path, unwinding included.

use std::cell::RefCell;
use std::marker::PhantomData;

use super::{ContextHandle, ContextId};

thread_local! {
    static CURRENT: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
}

/// The context the calling thread is executing inside, if any
pub fn current() -> Option<ContextHandle> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Identifier of the ambient context, if any
pub fn current_id() -> Option<ContextId> {
    CURRENT.with(|slot| slot.borrow().as_ref().map(ContextHandle::id))
}

/// Guard that keeps a context ambient on this thread until dropped
pub struct AmbientScope {
    entered: ContextHandle,
    previous: Option<ContextHandle>,
    // Restoring must happen on the thread that entered.
    _not_send: PhantomData<*const ()>,
}

impl AmbientScope {
    pub fn enter(context: &ContextHandle) -> Self {
        context.enter();
        let previous = CURRENT.with(|slot| slot.borrow_mut().replace(context.clone()));
        Self {
            entered: context.clone(),
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for AmbientScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
        self.entered.leave();
    }
}
