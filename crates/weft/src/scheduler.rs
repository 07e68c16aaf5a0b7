//! Scheduler capability.
//!
//! The core defers work to the owning thread only through this trait; the
//! run-loop adapter crate provides the queueing implementation.

/// A deferred unit of work.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Capability to defer an action for later execution on the owning thread.
pub trait Scheduler {
    fn post(&self, action: Action);
}

/// Runs actions inline, with no deferral. Useful in tests and in contexts
/// that are already on the owning thread with nothing else pending.
pub struct Immediate;

impl Scheduler for Immediate {
    fn post(&self, action: Action) {
        action();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn immediate_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        Immediate.post(Box::new(move || r.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}
