//! Overlap guard for periodic jobs
//!
//! A timer can fire again while the previous run is still waiting on a slow
//! host. Jobs that must not overlap take a permit first and skip the cycle
//! when none is available.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flag that admits one holder at a time
#[derive(Debug, Clone, Default)]
pub struct NonReentrantGuard {
    busy: Arc<AtomicBool>,
}

impl NonReentrantGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard, or `None` if a previous run still holds it
    pub fn try_enter(&self) -> Option<GuardPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the guard when dropped, including on early return or panic
#[derive(Debug)]
pub struct GuardPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
