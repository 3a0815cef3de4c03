//! # Jiffies Updater
//!
//! Global tick counter and the time of its last advance, protected by a
//! sequence lock. Any CPU may call [`JiffiesClock::advance_if_due`]; the
//! writer lock serializes them, so two CPUs that both believe they own the
//! timer duty still account every period exactly once.

use crate::seqlock::SeqLock;
use crate::time::{Duration, Jiffies, Timestamp};

/// State protected by the jiffies sequence lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JiffiesState {
    /// Ticks since boot
    pub jiffies: Jiffies,
    /// Time of the last jiffies advance
    pub last_update: Timestamp,
    /// Boundary of the next period
    pub next_period: Timestamp,
}

/// Global jiffies clock
#[derive(Debug)]
pub struct JiffiesClock {
    state: SeqLock<JiffiesState>,
    tick_period: Duration,
}

impl JiffiesClock {
    /// Create a clock ticking every `tick_period`
    pub const fn new(tick_period: Duration) -> Self {
        Self {
            state: SeqLock::new(JiffiesState {
                jiffies: 0,
                last_update: Timestamp::ZERO,
                next_period: Timestamp::ZERO,
            }),
            tick_period,
        }
    }

    /// Tick period
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Consistent snapshot of the protected state
    pub fn snapshot(&self) -> JiffiesState {
        self.state.read()
    }

    /// Current tick count
    pub fn jiffies(&self) -> Jiffies {
        self.state.read().jiffies
    }

    /// Time of the last jiffies advance
    pub fn last_update(&self) -> Timestamp {
        self.state.read().last_update
    }

    /// Record where the periodic tick will land next (set by the tick
    /// device setup before the first baseline is taken)
    pub fn set_next_period(&self, next: Timestamp) {
        self.state.write().next_period = next;
    }

    /// Advance jiffies by the whole periods elapsed up to `now`.
    ///
    /// Returns the number of ticks added, 0 when less than a period has
    /// passed since the last advance.
    pub fn advance_if_due(&self, now: Timestamp) -> u64 {
        let period = self.tick_period.as_nanos();

        // Lockless quick check
        if now.duration_since(self.last_update()).as_nanos() < period {
            return 0;
        }

        let mut state = self.state.write();

        let delta = now.duration_since(state.last_update).as_nanos();
        if delta < period {
            return 0;
        }

        let ticks = delta / period;
        state.last_update = Timestamp::from_nanos(state.last_update.as_nanos() + ticks * period);
        state.jiffies = state.jiffies.wrapping_add(ticks);
        state.next_period = state.last_update.saturating_add(self.tick_period);

        ticks
    }

    /// Establish the jiffies baseline once and return it.
    ///
    /// The first caller moves the baseline to the recorded next period;
    /// later callers get the current baseline unchanged.
    pub fn init_baseline(&self) -> Timestamp {
        let mut state = self.state.write();
        if state.last_update == Timestamp::ZERO {
            state.last_update = state.next_period;
        }
        state.last_update
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::sync::Arc;
    use std::thread;

    fn clock() -> JiffiesClock {
        JiffiesClock::new(Duration::from_millis(10))
    }

    #[test]
    fn test_no_advance_within_period() {
        let clock = clock();
        assert_eq!(clock.advance_if_due(Timestamp::from_millis(9)), 0);
        assert_eq!(clock.jiffies(), 0);
        assert_eq!(clock.last_update(), Timestamp::ZERO);
    }

    #[test]
    fn test_advance_whole_periods() {
        let clock = clock();

        assert_eq!(clock.advance_if_due(Timestamp::from_millis(25)), 2);
        assert_eq!(clock.jiffies(), 2);
        assert_eq!(clock.last_update(), Timestamp::from_millis(20));
        assert_eq!(clock.snapshot().next_period, Timestamp::from_millis(30));

        assert_eq!(clock.advance_if_due(Timestamp::from_millis(29)), 0);
        assert_eq!(clock.advance_if_due(Timestamp::from_millis(30)), 1);
        assert_eq!(clock.jiffies(), 3);
    }

    #[test]
    fn test_long_gap_single_step() {
        let clock = clock();
        let ticks = clock.advance_if_due(Timestamp::from_millis(86_400_000 + 7));

        assert_eq!(ticks, 8_640_000);
        assert_eq!(clock.last_update(), Timestamp::from_millis(86_400_000));
    }

    #[test]
    fn test_monotonic_sequence() {
        let clock = clock();
        let mut last = (0, Timestamp::ZERO);

        for ms in (0..5_000u64).step_by(7) {
            clock.advance_if_due(Timestamp::from_millis(ms));
            let snap = clock.snapshot();

            assert!(snap.jiffies >= last.0);
            assert!(snap.last_update >= last.1);
            assert_eq!(snap.jiffies, ms / 10);
            last = (snap.jiffies, snap.last_update);
        }
    }

    #[test]
    fn test_init_baseline_idempotent() {
        let clock = clock();
        clock.set_next_period(Timestamp::from_millis(40));

        assert_eq!(clock.init_baseline(), Timestamp::from_millis(40));

        clock.set_next_period(Timestamp::from_millis(90));
        assert_eq!(clock.init_baseline(), Timestamp::from_millis(40));
    }

    #[test]
    fn test_concurrent_advance_counts_once() {
        let clock = Arc::new(clock());

        let handles: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || {
                    let mut added = 0;
                    for ms in 0..=1_000u64 {
                        added += clock.advance_if_due(Timestamp::from_millis(ms));
                    }
                    added
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(total, 100);
        assert_eq!(clock.jiffies(), 100);
    }
}
