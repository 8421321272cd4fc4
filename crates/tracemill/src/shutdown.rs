//! Process-wide shutdown coordination.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Relaxed, Release};

/// Shared by the supervisor, the signal handler, and each source's
/// merger thread.
///
/// `halt_requested` ends the run: the supervisor will not start another
/// source. `source_halted` ends only the current source; the supervisor
/// clears it before starting the next one.
#[derive(Debug, Default)]
pub struct ShutdownToken {
    halt_requested: AtomicBool,
    source_halted: AtomicBool,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal-handler path: stop the current source and the outer loop.
    pub fn request_halt(&self) {
        self.halt_requested.store(true, Release);
        self.source_halted.store(true, Release);
    }

    pub fn halt_requested(&self) -> bool {
        self.halt_requested.load(Relaxed)
    }

    /// Merger path: the current source has fully drained.
    pub fn signal_source_halted(&self) {
        self.source_halted.store(true, Release);
    }

    pub fn source_halted(&self) -> bool {
        self.source_halted.load(Relaxed)
    }

    pub fn reset_source(&self) {
        self.source_halted.store(false, Release);
    }
}
