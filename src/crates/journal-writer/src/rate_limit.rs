//! Flood protection for incoming messages.
//!
//! Priorities are grouped into a few pools (emergency to critical, error,
//! warning, notice and info, debug). Each pool admits a burst of messages
//! per interval and counts what it turns away, so that the engine can note
//! the number of suppressed messages once the interval is over.

use crate::config::RateLimitPolicy;

const POOLS: usize = 5;

fn pool_of(priority: u8) -> usize {
    match priority & 7 {
        0..=2 => 0,
        3 => 1,
        4 => 2,
        5 | 6 => 3,
        _ => 4,
    }
}

/// Scales `burst` with the free space left for the journal.
///
/// Up to 1MiB the configured burst applies. Every further factor of 16
/// adds one more multiple: 16MiB doubles it, 256MiB triples it, 4GiB
/// quadruples it and so on.
pub fn burst_modulate(burst: u32, available: u64) -> u32 {
    let k = available.checked_ilog2().unwrap_or(0);
    if k <= 20 {
        return burst;
    }

    let scaled = u64::from(burst) * u64::from(k - 16) / 4;
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// Outcome of [`RateLimiter::test`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The message may be stored
    Allow,
    /// The message may be stored. It opens a new interval after the
    /// previous one turned away this many messages.
    AllowAfterSuppressed(u32),
    /// The message is dropped
    Deny,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Verdict::Deny)
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct Pool {
    begin: Option<u64>,
    num: u32,
    suppressed: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    interval_usec: u64,
    burst: u32,
    pools: [Pool; POOLS],
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            interval_usec: policy.interval.as_micros() as u64,
            burst: policy.burst,
            pools: [Pool::default(); POOLS],
        }
    }

    /// Accounts for one message of `priority` arriving at monotonic time
    /// `now_usec`, with `available` bytes left for the journal.
    pub fn test(&mut self, priority: u8, available: u64, now_usec: u64) -> Verdict {
        if self.interval_usec == 0 || self.burst == 0 {
            return Verdict::Allow;
        }

        let burst = burst_modulate(self.burst, available);
        let pool = &mut self.pools[pool_of(priority)];

        let Some(begin) = pool.begin else {
            *pool = Pool {
                begin: Some(now_usec),
                num: 1,
                suppressed: 0,
            };
            return Verdict::Allow;
        };

        if begin.saturating_add(self.interval_usec) <= now_usec {
            let suppressed = pool.suppressed;
            *pool = Pool {
                begin: Some(now_usec),
                num: 1,
                suppressed: 0,
            };

            return match suppressed {
                0 => Verdict::Allow,
                n => Verdict::AllowAfterSuppressed(n),
            };
        }

        if pool.num < burst {
            pool.num += 1;
            return Verdict::Allow;
        }

        pool.suppressed += 1;
        Verdict::Deny
    }
}
