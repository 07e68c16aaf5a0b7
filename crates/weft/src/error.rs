//! Failure payloads for awaitable operations.
//!
//! A body reports failure by returning a [`Fault`]. Once stored on an
//! awaitable, the fault is shared out as a [`Failure`] — a cheaply clonable,
//! identity-preserving handle. Every `wait()` on a failed awaitable returns
//! a clone of the *same* `Failure` ([`Failure::ptr_eq`] holds across calls).

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Why an awaitable operation failed.
#[derive(Debug, Error)]
pub enum Fault {
    /// A free-form failure message.
    #[error("{0}")]
    Message(String),

    /// The awaitable was dropped before reaching a terminal state.
    #[error("awaitable dropped before completion")]
    Abandoned,

    /// A child awaitable's failure, propagated through `?`.
    #[error(transparent)]
    Upstream(Failure),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Fault {
    pub fn msg(message: impl Into<String>) -> Self {
        Fault::Message(message.into())
    }
}

impl From<Failure> for Fault {
    fn from(failure: Failure) -> Self {
        Fault::Upstream(failure)
    }
}

/// Shared handle to a stored [`Fault`].
///
/// Clones share identity: re-awaiting a failed awaitable always yields the
/// same underlying fault, observable via [`Failure::ptr_eq`].
#[derive(Debug, Clone)]
pub struct Failure(Arc<Fault>);

impl Failure {
    pub(crate) fn new(fault: Fault) -> Self {
        Failure(Arc::new(fault))
    }

    pub fn fault(&self) -> &Fault {
        &self.0
    }

    pub fn ptr_eq(a: &Failure, b: &Failure) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_clones_share_identity() {
        let failure = Failure::new(Fault::msg("boom"));
        let copy = failure.clone();
        assert!(Failure::ptr_eq(&failure, &copy));
        assert_eq!(copy.to_string(), "boom");
    }

    #[test]
    fn distinct_failures_differ() {
        let a = Failure::new(Fault::msg("a"));
        let b = Failure::new(Fault::msg("a"));
        assert!(!Failure::ptr_eq(&a, &b));
    }

    #[test]
    fn upstream_displays_inner() {
        let inner = Failure::new(Fault::msg("root cause"));
        let fault = Fault::from(inner);
        assert_eq!(fault.to_string(), "root cause");
    }
}
