//! Cooperative cancellation shared by the relay and diagnostic loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stop flag polled once per loop iteration.
///
/// Clones share the same flag. There is a single writer (the stop notifier),
/// so a plain atomic is enough.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    stopped: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the running loop to stop
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Clear the flag at the start of a new run
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}
