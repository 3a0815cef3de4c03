//! # Time Types
//!
//! Monotonic timestamps, durations and jiffies used by the tick controller.
//! All values are nanoseconds since boot. `Timestamp::MAX` stands for
//! "never" (no event programmed).

use core::fmt;

/// Nanoseconds per second
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Nanoseconds per microsecond
pub const NSEC_PER_USEC: u64 = 1_000;

/// Tick counter value
pub type Jiffies = u64;

/// Jiffies delta signalling that no timer is pending in the foreseeable
/// future. Timer wheels report `from + NEXT_TIMER_MAX_DELTA` in that case.
pub const NEXT_TIMER_MAX_DELTA: Jiffies = (1 << 30) - 1;

// =============================================================================
// TIMESTAMP
// =============================================================================

/// Point on the monotonic clock
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    nanos: u64,
}

impl Timestamp {
    /// Boot time
    pub const ZERO: Timestamp = Timestamp { nanos: 0 };

    /// End of time
    pub const MAX: Timestamp = Timestamp { nanos: u64::MAX };

    /// Create from nanoseconds
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Create from milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    /// Get nanoseconds
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Get microseconds
    pub const fn as_micros(&self) -> u64 {
        self.nanos / NSEC_PER_USEC
    }

    /// Is this the "never" value?
    pub const fn is_max(&self) -> bool {
        self.nanos == u64::MAX
    }

    /// Duration since another timestamp, zero if `earlier` is later
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }

    /// Add a duration, saturating at [`Timestamp::MAX`]
    pub fn saturating_add(self, delta: Duration) -> Timestamp {
        Timestamp::from_nanos(self.nanos.saturating_add(delta.as_nanos()))
    }

    /// Move this expiry forward by whole `interval`s until it lies strictly
    /// after `now`.
    ///
    /// Returns the number of intervals added. An expiry already in the
    /// future is left alone and 0 is returned. Long gaps are handled with a
    /// single division rather than by stepping.
    pub fn forward(&mut self, now: Timestamp, interval: Duration) -> u64 {
        if now < *self {
            return 0;
        }

        let incr = interval.as_nanos().max(1);
        let delta = now.nanos - self.nanos;
        let mut overruns = 1;

        if delta >= incr {
            overruns = delta / incr;
            self.nanos = self.nanos.saturating_add(incr.saturating_mul(overruns));
            if self.nanos > now.nanos {
                return overruns;
            }
            overruns += 1;
        }

        self.nanos = self.nanos.saturating_add(incr);
        overruns
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "Timestamp(MAX)")
        } else {
            write!(f, "Timestamp({}ns)", self.nanos)
        }
    }
}

// =============================================================================
// DURATION
// =============================================================================

/// Length of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { nanos: 0 };

    /// Unbounded
    pub const MAX: Duration = Duration { nanos: u64::MAX };

    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self {
            nanos: micros * 1_000,
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs * NSEC_PER_SEC,
        }
    }

    /// Period of a tick running at `hz` interrupts per second; zero for a
    /// rate of zero
    pub const fn from_hz(hz: u64) -> Self {
        if hz == 0 {
            return Self::ZERO;
        }
        Self {
            nanos: NSEC_PER_SEC / hz,
        }
    }

    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    pub const fn as_micros(&self) -> u64 {
        self.nanos / NSEC_PER_USEC
    }

    pub const fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    /// Multiply by a tick count, saturating at [`Duration::MAX`]
    pub fn saturating_mul(self, count: u64) -> Duration {
        Duration::from_nanos(self.nanos.saturating_mul(count))
    }

    pub fn saturating_add(self, other: Duration) -> Duration {
        Duration::from_nanos(self.nanos.saturating_add(other.nanos))
    }
}

// =============================================================================
// TESTS
// =============================================================================
