//! Consecutive-failure accounting for a backend instance

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::error;

/// Counts consecutive failures and latches a fatal state past a threshold
///
/// Once fatal, the tracker never recovers; the owning backend must be rebuilt.
#[derive(Debug)]
pub struct FailureTracker {
    name: String,
    threshold: u32,
    consecutive: AtomicU32,
    fatal: AtomicBool,
}

impl FailureTracker {
    pub fn new<S: Into<String>>(name: S, threshold: u32) -> Self {
        Self {
            name: name.into(),
            threshold,
            consecutive: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    /// Returns true if this failure made (or found) the tracker fatal
    pub fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.threshold {
            self.trip(&format!("{} consecutive failures", count));
        }
        self.is_fatal()
    }

    /// Latch fatal regardless of the counter
    pub fn trip(&self, reason: &str) {
        if !self.fatal.swap(true, Ordering::SeqCst) {
            error!(
                backend = %self.name,
                reason = reason,
                "Backend declared fatal, refusing further session traffic"
            );
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
