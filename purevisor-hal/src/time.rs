//! Clock abstraction
//!
//! The core needs exactly two time sources: a monotonic millisecond tick
//! that drives replicated-log timers, and a fast cycle counter for
//! latency accounting. Both are behind one trait so tests can substitute
//! a hand-advanced clock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic time source.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u64;

    /// Fast free-running cycle counter.
    fn cycles(&self) -> u64;
}

/// Read the time-stamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: RDTSC is unprivileged when CR4.TSD is clear, which the
        // hypervisor guarantees for itself.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}

/// TSC-derived clock for bare-metal use.
///
/// Millisecond readings divide the counter by a calibrated
/// cycles-per-millisecond value supplied at construction.
pub struct TscClock {
    cycles_per_ms: u64,
}

impl TscClock {
    pub const fn new(cycles_per_ms: u64) -> Self {
        TscClock { cycles_per_ms: if cycles_per_ms == 0 { 1 } else { cycles_per_ms } }
    }
}

impl Clock for TscClock {
    fn now_ms(&self) -> u64 {
        rdtsc() / self.cycles_per_ms
    }

    fn cycles(&self) -> u64 {
        rdtsc()
    }
}

/// Hand-advanced clock used by the test suite and by deterministic replay.
#[derive(Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        ManualClock { ms: AtomicU64::new(0) }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value: u64) {
        self.ms.store(value, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }

    fn cycles(&self) -> u64 {
        // 1 MHz equivalent keeps cycle math well defined under test.
        self.ms.load(Ordering::SeqCst) * 1000
    }
}
