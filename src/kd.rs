//! Kernel debugger connectivity probes.
//!
//! The transport itself is outside this subsystem; delivery only needs to
//! know whether a debugger is listening and whether it wants user-mode
//! exceptions.

use core::sync::atomic::{AtomicBool, Ordering};

pub struct KdState {
    connected: AtomicBool,
    user_exceptions: AtomicBool,
}

impl KdState {
    pub const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            user_exceptions: AtomicBool::new(false),
        }
    }

    pub fn is_debugger_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn are_user_exceptions_enabled(&self) -> bool {
        self.user_exceptions.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_user_exceptions_enabled(&self, enabled: bool) {
        self.user_exceptions.store(enabled, Ordering::Relaxed);
    }
}

impl Default for KdState {
    fn default() -> Self {
        Self::new()
    }
}
