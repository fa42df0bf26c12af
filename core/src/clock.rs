//! Time sources for bucketing, latencies and sleep windows
//!
//! All timestamps in this crate are milliseconds relative to a clock anchor,
//! never wall-clock time, so NTP adjustments cannot reopen a closed bucket or
//! shorten a sleep window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic milliseconds
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since the clock's anchor
    fn now_millis(&self) -> u64;
}

/// Monotonic clock anchored at construction
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to
///
/// Lets tests step through bucket boundaries and sleep windows without
/// sleeping.
///
/// ```rust
/// use command_machines::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// clock.advance(150);
/// assert_eq!(clock.now_millis(), 150);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
        }
    }

    /// Move the clock forward by `millis`
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    /// Jump to an absolute reading; readings never go backwards
    pub fn set(&self, millis: u64) {
        self.now.fetch_max(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
