//! Global run state shared by every worker thread
//!
//! The original hardware threads, the SMC worker and the main thread all
//! observe the same two flags. They are carried explicitly in an `Arc`
//! rather than as process statics so tests can run isolated systems.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How long shutdown waits for workers to drain before giving up
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Shared run/pause state
pub struct SystemSignals {
    running: AtomicBool,
    paused: AtomicBool,
    /// Workers park here while paused; also woken on shutdown
    pause_lock: Mutex<()>,
    pause_cvar: Condvar,
}

impl SystemSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            pause_cvar: Condvar::new(),
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Request shutdown; every worker drains at its next boundary
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.pause_cvar.notify_all();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.pause_cvar.notify_all();
    }

    /// Block the calling worker while the system is paused.
    ///
    /// Returns immediately once shutdown has been requested.
    pub fn wait_if_paused(&self) {
        while self.is_paused() && self.is_running() {
            let mut guard = self.pause_lock.lock();
            if self.is_paused() && self.is_running() {
                self.pause_cvar
                    .wait_for(&mut guard, Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_lifecycle() {
        let signals = SystemSignals::new();
        assert!(signals.is_running());
        assert!(!signals.is_paused());

        signals.pause();
        assert!(signals.is_paused());
        signals.resume();
        assert!(!signals.is_paused());

        signals.request_shutdown();
        assert!(!signals.is_running());
    }

    #[test]
    fn test_wait_if_paused_returns_on_shutdown() {
        let signals = SystemSignals::new();
        signals.pause();
        signals.request_shutdown();
        // Must not deadlock
        signals.wait_if_paused();
    }
}
