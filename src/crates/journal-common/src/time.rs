//! Timestamps used by journal entries.
//!
//! Every entry carries a wall-clock timestamp and a monotonic timestamp that
//! is only meaningful together with the boot id it was taken under.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::ops::{Add, Sub};

pub const USEC_PER_SEC: u64 = 1_000_000;
pub const USEC_PER_MINUTE: u64 = 60 * USEC_PER_SEC;
pub const USEC_PER_HOUR: u64 = 60 * USEC_PER_MINUTE;
pub const USEC_PER_DAY: u64 = 24 * USEC_PER_HOUR;
pub const USEC_PER_MONTH: u64 = 2_629_800 * USEC_PER_SEC;

/// Upper bound (exclusive) for every timestamp stored in a journal file.
///
/// Realtime values below it cover dates until roughly the year 3112, monotonic
/// values cover about 1142 years of uptime.
pub const TIMESTAMP_LIMIT: u64 = 1 << 55;

pub fn valid_realtime(usec: u64) -> bool {
    usec > 0 && usec < TIMESTAMP_LIMIT
}

pub fn valid_monotonic(usec: u64) -> bool {
    usec < TIMESTAMP_LIMIT
}

pub fn valid_epoch(epoch: u64) -> bool {
    epoch < TIMESTAMP_LIMIT
}

/// Timestamp in microseconds.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Microseconds(pub u64);

impl Microseconds {
    pub fn new(microseconds: u64) -> Self {
        Self(microseconds)
    }

    /// Current wall-clock time since the Unix epoch.
    pub fn now() -> Self {
        let duration = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        Self(duration.as_micros() as u64)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl From<u64> for Microseconds {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<std::time::Duration> for Microseconds {
    fn from(value: std::time::Duration) -> Self {
        Self(value.as_micros() as u64)
    }
}

impl Add for Microseconds {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl Sub for Microseconds {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

impl std::fmt::Display for Microseconds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.0)
    }
}

/// A wall-clock and monotonic timestamp pair taken at the same instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualTimestamp {
    pub realtime: u64,
    pub monotonic: u64,
}

impl DualTimestamp {
    pub fn new(realtime: u64, monotonic: u64) -> Self {
        Self {
            realtime,
            monotonic,
        }
    }

    /// Samples both clocks.
    pub fn now() -> std::io::Result<Self> {
        Ok(Self {
            realtime: Microseconds::now().get(),
            monotonic: monotonic_now()?.get(),
        })
    }

    pub fn is_valid(&self) -> bool {
        valid_realtime(self.realtime) && valid_monotonic(self.monotonic)
    }
}

/// A realtime clock whose readings never go backwards.
///
/// When the system clock jumps back, readings continue one microsecond past
/// the largest value handed out so far.
#[derive(Debug)]
pub struct RealtimeClock {
    max_seen: Cell<u64>,
}

impl RealtimeClock {
    pub fn new() -> Self {
        Self::with_initial(Microseconds::now())
    }

    /// Resumes from a persisted value, e.g. the tail entry of a journal file.
    pub fn with_initial(initial: Microseconds) -> Self {
        Self {
            max_seen: Cell::new(initial.get()),
        }
    }

    pub fn now(&self) -> Microseconds {
        let current = Microseconds::now().get();
        let max = self.max_seen.get();

        let next = if current > max {
            current
        } else {
            max.saturating_add(1)
        };

        self.max_seen.set(next);
        Microseconds::new(next)
    }

    pub fn last_seen(&self) -> Microseconds {
        Microseconds::new(self.max_seen.get())
    }
}

impl Default for RealtimeClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Microseconds since boot according to `CLOCK_MONOTONIC`.
pub fn monotonic_now() -> std::io::Result<Microseconds> {
    use nix::sys::time::TimeValLike;
    use nix::time::ClockId;

    let ts = ClockId::CLOCK_MONOTONIC
        .now()
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    Ok(Microseconds::new(ts.num_microseconds() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_validity_excludes_zero_and_overflow() {
        assert!(!valid_realtime(0));
        assert!(valid_realtime(1));
        assert!(valid_realtime(TIMESTAMP_LIMIT - 1));
        assert!(!valid_realtime(TIMESTAMP_LIMIT));
        assert!(!valid_realtime(u64::MAX));
    }

    #[test]
    fn monotonic_validity_allows_zero() {
        assert!(valid_monotonic(0));
        assert!(!valid_monotonic(TIMESTAMP_LIMIT));
        assert!(valid_epoch(TIMESTAMP_LIMIT - 1));
        assert!(!valid_epoch(TIMESTAMP_LIMIT));
    }

    #[test]
    fn dual_timestamp_validity() {
        assert!(DualTimestamp::new(1, 0).is_valid());
        assert!(!DualTimestamp::new(0, 0).is_valid());
        assert!(!DualTimestamp::new(1, TIMESTAMP_LIMIT).is_valid());
    }

    #[test]
    fn realtime_clock_never_goes_backwards() {
        let far_future = Microseconds::now().get() + USEC_PER_DAY;
        let clock = RealtimeClock::with_initial(Microseconds::new(far_future));

        let a = clock.now();
        let b = clock.now();
        assert_eq!(a.get(), far_future + 1);
        assert_eq!(b.get(), far_future + 2);
        assert_eq!(clock.last_seen(), b);
    }

    #[test]
    fn realtime_clock_follows_system_time() {
        let clock = RealtimeClock::with_initial(Microseconds::new(0));
        let reading = clock.now();
        assert!(reading.get() > 0);
        assert!(clock.now() > reading);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_now().unwrap();
        let b = monotonic_now().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn microseconds_arithmetic() {
        let a = Microseconds::new(10);
        let b = Microseconds::new(4);
        assert_eq!(a + b, Microseconds::new(14));
        assert_eq!(a - b, Microseconds::new(6));
        assert_eq!(b.saturating_sub(a), Microseconds::new(0));
        assert_eq!(Microseconds::from(std::time::Duration::from_secs(2)).get(), 2 * USEC_PER_SEC);
    }
}
