//! Guard against late callbacks.
//!
//! When bridging a callback-style API, the adapter takes a [`GuardToken`]
//! before arming the callback. If the guard is dropped — because its owning
//! scope exited or the operation was cancelled — the token reports blocked
//! and the callback returns without touching freed state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Blocks its tokens when dropped (or explicitly via [`block`](Self::block)).
pub struct CallbackGuard {
    blocked: Arc<AtomicBool>,
}

/// Shared view of a guard's blocked flag. Stays readable after the guard is
/// gone.
#[derive(Clone)]
pub struct GuardToken {
    blocked: Arc<AtomicBool>,
}

impl CallbackGuard {
    pub fn new() -> Self {
        CallbackGuard { blocked: Arc::new(AtomicBool::new(false)) }
    }

    pub fn token(&self) -> GuardToken {
        GuardToken { blocked: self.blocked.clone() }
    }

    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }
}

impl Default for CallbackGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.block();
    }
}

impl GuardToken {
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Wrap a callback so it becomes a no-op once the guard is blocked.
    pub fn wrap<F: FnOnce()>(self, f: F) -> impl FnOnce() {
        move || {
            if !self.is_blocked() {
                f();
            }
        }
    }
}
