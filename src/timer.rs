//! Guest timer
//!
//! A monotonic 64-bit counter derived from the host clock, read by the
//! `time`/`timeh` CSRs and the CLINT, and compared against per-hart
//! timer comparators.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Default timebase frequency, 10 MHz
pub const TIMER_FREQ: u64 = 10_000_000;

pub struct RvTimer {
    freq: u64,
    base: Instant,
    /// Tick adjustment applied on top of the host clock (guest mtime writes)
    offset: AtomicI64,
}

impl RvTimer {
    pub fn new(freq: u64) -> Self {
        RvTimer {
            freq,
            base: Instant::now(),
            offset: AtomicI64::new(0),
        }
    }

    pub fn freq(&self) -> u64 {
        self.freq
    }

    fn host_ticks(&self) -> u64 {
        let elapsed = self.base.elapsed();
        elapsed
            .as_secs()
            .wrapping_mul(self.freq)
            .wrapping_add((elapsed.subsec_nanos() as u64 * self.freq) / 1_000_000_000)
    }

    /// Current counter value
    pub fn get(&self) -> u64 {
        self.host_ticks()
            .wrapping_add(self.offset.load(Ordering::Relaxed) as u64)
    }

    /// Rebase the counter so it reads `count` now
    pub fn rebase(&self, count: u64) {
        let host = self.host_ticks();
        self.offset
            .store(count.wrapping_sub(host) as i64, Ordering::Relaxed);
    }
}

/// Timer comparator, shared between the owning hart and the timer thread
pub struct Timecmp {
    cmp: AtomicU64,
}

impl Timecmp {
    pub fn new() -> Self {
        // All-ones never fires
        Timecmp {
            cmp: AtomicU64::new(u64::MAX),
        }
    }

    pub fn set(&self, value: u64) {
        self.cmp.store(value, Ordering::Release);
    }

    pub fn get(&self) -> u64 {
        self.cmp.load(Ordering::Acquire)
    }

    pub fn pending(&self, timer: &RvTimer) -> bool {
        timer.get() >= self.get()
    }
}

impl Default for Timecmp {
    fn default() -> Self {
        Self::new()
    }
}
