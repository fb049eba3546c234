//! Wall-clock time source.

use harbor_engine::{Clock, Timestamp};

/// Milliseconds since the Unix epoch from the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}
