//! Engine control flags.
//!
//! Lock-free flags shared by every loop. Checked before any order-placing
//! path; two atomic loads, no locks.

use std::sync::atomic::{AtomicBool, Ordering};

/// Global control flags.
#[derive(Debug)]
pub struct ControlFlags {
    /// Detected opportunities open hedges automatically.
    pub auto_hedge: AtomicBool,

    /// Set by emergency shutdown; blocks every new open.
    pub emergency_stop: AtomicBool,

    /// Set on SIGINT / operator stop; loops stop accepting new ticks.
    pub shutdown_requested: AtomicBool,
}

impl ControlFlags {
    pub fn new(auto_hedge: bool) -> Self {
        Self {
            auto_hedge: AtomicBool::new(auto_hedge),
            emergency_stop: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// Whether a new hedge may be opened right now.
    #[inline(always)]
    pub fn can_open(&self) -> bool {
        self.auto_hedge.load(Ordering::Acquire)
            && !self.emergency_stop.load(Ordering::Acquire)
            && !self.shutdown_requested.load(Ordering::Acquire)
    }

    #[inline]
    pub fn enable_hedging(&self) {
        self.auto_hedge.store(true, Ordering::Release);
    }

    #[inline]
    pub fn disable_hedging(&self) {
        self.auto_hedge.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_hedging_enabled(&self) -> bool {
        self.auto_hedge.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_emergency_stop(&self) {
        self.emergency_stop.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::Acquire)
    }

    #[inline]
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_open_requires_auto_hedge_without_stops() {
        let flags = ControlFlags::new(false);
        assert!(!flags.can_open());

        flags.enable_hedging();
        assert!(flags.can_open());

        flags.set_emergency_stop();
        assert!(!flags.can_open());
    }

    #[test]
    fn shutdown_blocks_opens() {
        let flags = ControlFlags::new(true);
        assert!(flags.can_open());
        flags.request_shutdown();
        assert!(!flags.can_open());
    }
}
