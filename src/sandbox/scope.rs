//! Thread-scoped binding of the current sandbox's dispatch handler.
//!
//! Rewritten code reaches "the dispatch handler" through this module. Each thread has at
//! most one bound handler; [`enter`] binds one and returns a guard that restores the
//! previous binding when dropped, including while unwinding.

use std::{cell::RefCell, sync::Arc};

use crate::{dispatch::DispatchHandler, DispatchError, Result};

thread_local! {
    static CURRENT: RefCell<Option<Arc<DispatchHandler>>> = const { RefCell::new(None) };
}

/// Guard keeping a handler bound to the current thread.
#[must_use = "the sandbox is unbound as soon as the scope is dropped"]
pub struct SandboxScope {
    previous: Option<Arc<DispatchHandler>>,
}

impl Drop for SandboxScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Binds `handler` to the current thread until the returned guard is dropped.
pub fn enter(handler: Arc<DispatchHandler>) -> SandboxScope {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(handler));
    SandboxScope { previous }
}

/// The handler bound to the current thread.
///
/// # Errors
/// Returns [`DispatchError::NoActiveSandbox`] if none is bound.
pub fn current_handler() -> Result<Arc<DispatchHandler>> {
    CURRENT
        .with(|current| current.borrow().clone())
        .ok_or_else(|| DispatchError::NoActiveSandbox.into())
}

/// Returns `true` if `handler` is the one bound to the current thread.
#[must_use]
pub fn is_current(handler: &Arc<DispatchHandler>) -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, handler))
    })
}

/// Clears the current thread's binding if it is `handler`.
pub(crate) fn unbind_if(handler: &Arc<DispatchHandler>) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, handler)) {
            *current = None;
        }
    });
}
