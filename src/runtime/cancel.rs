//! Cooperative cancellation primitives.
//!
//! Async operations observe their token at each suspension-point boundary
//! and finish with `ECANCELED` once it reports a stop request. Nothing is
//! interrupted mid-syscall; cancellation latency is bounded by the
//! operation's polling slice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read-only view of a shared stop flag.
///
/// The default token never reports cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    /// `true` once the associated source has requested cancellation.
    pub fn stop_requested(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.load(Ordering::Acquire))
    }
}

/// Owner side of a shared stop flag; signals every derived token.
#[derive(Debug, Clone)]
pub struct CancelSource {
    state: Arc<AtomicBool>,
}

impl CancelSource {
    pub fn new() -> Self {
        CancelSource {
            state: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token bound to this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Some(self.state.clone()),
        }
    }

    /// Request cancellation for all tokens derived from this source.
    pub fn request_stop(&self) {
        self.state.store(true, Ordering::Release);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        CancelSource::new()
    }
}
