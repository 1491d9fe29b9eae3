//! Micro-precision wall-clock timestamps.
//!
//! Probe timestamps cross the wire and are compared between hosts, so they
//! are wall-clock (seconds + microseconds since the Unix epoch) rather than
//! monotonic. Pacing inside the sender uses `std::time::Instant`; only the
//! stamps that leave the process use this type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A wall-clock instant with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MicroTime {
    /// Whole seconds since the Unix epoch.
    pub sec: u64,
    /// Microseconds within the second, always < 1_000_000.
    pub usec: u32,
}

impl MicroTime {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            sec: d.as_secs(),
            usec: d.subsec_micros(),
        }
    }

    pub fn from_micros(us: u64) -> Self {
        Self {
            sec: us / 1_000_000,
            usec: (us % 1_000_000) as u32,
        }
    }

    pub fn as_micros(&self) -> u64 {
        self.sec * 1_000_000 + self.usec as u64
    }

    /// `self - earlier`, or `None` when `earlier` is in the future
    /// (unsynchronized clocks).
    pub fn checked_sub(&self, earlier: &MicroTime) -> Option<Duration> {
        self.as_micros()
            .checked_sub(earlier.as_micros())
            .map(Duration::from_micros)
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

impl fmt::Display for MicroTime {
    /// `<sec>.<usec>` with the microseconds zero-padded to six digits, the
    /// format used by the per-sample result lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}
