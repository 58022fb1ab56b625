//! Virtual clock sources.
//!
//! The channel reads the local simulator's virtual time to stamp packets and
//! may warp it forward during synchronization. Two sources are provided:
//! 1. **`ManualClock`:** Time only moves when told to; used by tests and by
//!    owners that drive their own event loop.
//! 2. **`HostClock`:** Host monotonic time plus any forward warps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Local virtual time in nanoseconds.
pub trait VirtualClock: Send + Sync {
    /// Current virtual time.
    fn now_ns(&self) -> u64;

    /// Moves virtual time forward to `target`. Never moves it backwards.
    ///
    /// Clocks that cannot be warped ignore the request.
    fn warp_to(&self, _target: u64) {}
}

/// Clock advanced explicitly by its owner.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub const fn new(start: u64) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    /// Advances the clock by `delta` ns and returns the new time.
    pub fn advance(&self, delta: u64) -> u64 {
        self.now.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Sets the clock to `t`, even backwards.
    pub fn set(&self, t: u64) {
        self.now.store(t, Ordering::Release);
    }
}

impl VirtualClock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn warp_to(&self, target: u64) {
        let _ = self.now.fetch_max(target, Ordering::AcqRel);
    }
}

/// Host monotonic time, offset by warps.
#[derive(Debug)]
pub struct HostClock {
    start: Instant,
    warp: AtomicU64,
}

impl HostClock {
    /// Creates a clock starting at zero now.
    pub fn new() -> Self {
        Self { start: Instant::now(), warp: AtomicU64::new(0) }
    }

    fn elapsed(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock for HostClock {
    fn now_ns(&self) -> u64 {
        self.elapsed().saturating_add(self.warp.load(Ordering::Acquire))
    }

    fn warp_to(&self, target: u64) {
        let now = self.now_ns();
        if target > now {
            let _ = self.warp.fetch_add(target - now, Ordering::AcqRel);
        }
    }
}
