//! # Per-CPU Tick State
//!
//! One [`CpuTickState`] per CPU. The tick record itself ([`TickSched`]) is
//! only touched by its own CPU with interrupts off, modelled here by a spin
//! mutex. The fields other CPUs look at live outside the mutex:
//!
//! ```text
//!   CpuTickState
//!   ├── sched: Mutex<TickSched>        local CPU only
//!   ├── idle: SeqLock<IdleAccounting>  written locally, read by anyone
//!   ├── check_clocks: AtomicBool       mailbox from clock notifications
//!   └── user_nohz: AtomicBool          read by the duty arbiter
//! ```

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::seqlock::SeqLock;
use crate::time::{Duration, Jiffies, Timestamp};

/// Tick emulation capability of a CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NohzMode {
    /// Periodic tick, never stopped
    #[default]
    Inactive,
    /// Oneshot clock event device driven directly
    LowRes,
    /// Tick emulated by a high resolution timer
    HighRes,
}

/// Accounting bucket for ticks skipped while the tick is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JiffiesWhence {
    #[default]
    None,
    Idle,
    User,
    System,
}

// =============================================================================
// TICK RECORD
// =============================================================================

/// Per-CPU tick record
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSched {
    pub nohz_mode: NohzMode,
    pub tick_stopped: bool,
    /// Inside the idle loop
    pub inidle: bool,
    /// This CPU held the timer duty when it last stopped the tick
    pub do_timer_last: bool,
    /// Expiry of the emulated tick
    pub sched_timer: Timestamp,
    /// Tick expiry saved on stop, restored on restart
    pub last_tick: Timestamp,
    pub idle_calls: u64,
    pub idle_sleeps: u64,
    pub idle_expires: Timestamp,
    pub idle_waketime: Timestamp,
    pub idle_exittime: Timestamp,
    pub last_jiffies: Jiffies,
    pub next_jiffies: Jiffies,
    pub sleep_length: Duration,
    /// Jiffies at the start of the current accounting interval
    pub saved_jiffies: Jiffies,
    pub saved_whence: JiffiesWhence,
    /// In the RCU extended quiescent state on behalf of a user task
    pub ext_qs: bool,
}

// =============================================================================
// IDLE ACCOUNTING
// =============================================================================

/// Cumulative idle and iowait time of a CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleAccounting {
    pub active: bool,
    pub entry: Timestamp,
    pub idle_sleep: Duration,
    pub iowait_sleep: Duration,
}

impl IdleAccounting {
    /// Close the open interval at `now`, crediting it to iowait or idle
    /// depending on the iowait state right now
    pub fn update(&mut self, now: Timestamp, iowait: bool) {
        if !self.active {
            return;
        }
        let delta = now.duration_since(self.entry);
        if iowait {
            self.iowait_sleep = self.iowait_sleep.saturating_add(delta);
        } else {
            self.idle_sleep = self.idle_sleep.saturating_add(delta);
        }
        self.entry = now;
    }

    /// Open a new idle interval
    pub fn start(&mut self, now: Timestamp, iowait: bool) {
        self.update(now, iowait);
        self.entry = now;
        self.active = true;
    }

    /// Close the idle interval
    pub fn stop(&mut self, now: Timestamp, iowait: bool) {
        self.update(now, iowait);
        self.active = false;
    }

    /// Idle time as of `now`, without closing the interval
    pub fn idle_at(&self, now: Timestamp, iowait: bool) -> Duration {
        if self.active && !iowait {
            self.idle_sleep.saturating_add(now.duration_since(self.entry))
        } else {
            self.idle_sleep
        }
    }

    /// Iowait time as of `now`, without closing the interval
    pub fn iowait_at(&self, now: Timestamp, iowait: bool) -> Duration {
        if self.active && iowait {
            self.iowait_sleep.saturating_add(now.duration_since(self.entry))
        } else {
            self.iowait_sleep
        }
    }
}

// =============================================================================
// CPU TICK STATE
// =============================================================================

/// Everything the controller keeps for one CPU
#[derive(Debug, Default)]
pub struct CpuTickState {
    sched: Mutex<TickSched>,
    idle: SeqLock<IdleAccounting>,
    check_clocks: AtomicBool,
    user_nohz: AtomicBool,
    idle_hwm: AtomicU64,
    iowait_hwm: AtomicU64,
}

impl CpuTickState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to the tick record
    pub fn lock(&self) -> MutexGuard<'_, TickSched> {
        self.sched.lock()
    }

    /// Idle statistics
    pub fn idle(&self) -> &SeqLock<IdleAccounting> {
        &self.idle
    }

    pub fn idle_active(&self) -> bool {
        self.idle.read().active
    }

    /// Post a clock change for the next evaluation
    pub fn notify_clocks(&self) {
        self.check_clocks.store(true, Ordering::Release);
    }

    /// Consume a pending clock change notification
    pub fn take_check_clocks(&self) -> bool {
        self.check_clocks.swap(false, Ordering::AcqRel)
    }

    /// Counted in the busy-tickless population
    pub fn user_nohz(&self) -> bool {
        self.user_nohz.load(Ordering::Acquire)
    }

    /// Set the busy-tickless flag, returning the previous value
    pub fn set_user_nohz(&self, on: bool) -> bool {
        self.user_nohz.swap(on, Ordering::AcqRel)
    }

    /// Never report less idle time than a previous query did
    pub fn clamp_idle(&self, micros: u64) -> u64 {
        self.idle_hwm.fetch_max(micros, Ordering::Relaxed).max(micros)
    }

    /// Never report less iowait time than a previous query did
    pub fn clamp_iowait(&self, micros: u64) -> u64 {
        self.iowait_hwm.fetch_max(micros, Ordering::Relaxed).max(micros)
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Diagnostic snapshot of a CPU's tick record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub nohz_mode: NohzMode,
    pub tick_stopped: bool,
    pub inidle: bool,
    pub idle_active: bool,
    pub user_nohz: bool,
    pub idle_calls: u64,
    pub idle_sleeps: u64,
    pub idle_expires: Timestamp,
    pub last_tick: Timestamp,
    pub sleep_length: Duration,
    pub saved_jiffies: Jiffies,
    pub saved_whence: JiffiesWhence,
    pub idle_sleep: Duration,
    pub iowait_sleep: Duration,
}

impl TickStats {
    pub(crate) fn capture(state: &CpuTickState, ts: &TickSched) -> Self {
        let idle = state.idle.read();
        Self {
            nohz_mode: ts.nohz_mode,
            tick_stopped: ts.tick_stopped,
            inidle: ts.inidle,
            idle_active: idle.active,
            user_nohz: state.user_nohz(),
            idle_calls: ts.idle_calls,
            idle_sleeps: ts.idle_sleeps,
            idle_expires: ts.idle_expires,
            last_tick: ts.last_tick,
            sleep_length: ts.sleep_length,
            saved_jiffies: ts.saved_jiffies,
            saved_whence: ts.saved_whence,
            idle_sleep: idle.idle_sleep,
            iowait_sleep: idle.iowait_sleep,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
