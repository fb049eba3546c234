//! Time sources for stamping items.
//!
//! The engine never reads the wall clock itself. Callers hand it a [`Clock`]
//! (the runtime uses the system clock, tests use [`ManualClock`]) and the
//! engine derives per-item timestamps from it.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// A source of millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Jump to an absolute time. Moving backwards is allowed so tests can
    /// simulate wall-clock skew.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `millis` and return the new time.
    pub fn advance(&self, millis: u64) -> Timestamp {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Stamp a mutation of an item last touched at `previous`.
///
/// Wall clocks can step backwards; `updatedAt` must not. The result is never
/// smaller than `previous`.
pub fn stamp_after(previous: Timestamp, now: Timestamp) -> Timestamp {
    previous.max(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_starts_where_told() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now(), 1000);
    }

    #[test]
    fn advance_moves_forward() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.advance(5), 1005);
        assert_eq!(clock.now(), 1005);
    }

    #[test]
    fn set_can_move_backwards() {
        let clock = ManualClock::new(1000);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn stamp_never_goes_backwards() {
        assert_eq!(stamp_after(2000, 1000), 2000);
        assert_eq!(stamp_after(1000, 2000), 2000);
        assert_eq!(stamp_after(1000, 1000), 1000);
    }
}
