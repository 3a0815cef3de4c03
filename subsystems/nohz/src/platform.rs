//! # Platform Collaborators
//!
//! Everything the tick controller needs from the rest of the kernel, as
//! capability traits. All methods take `&self`: implementations are shared by
//! every CPU and keep their own interior mutability.
//!
//! ```text
//!   ┌────────────────────────────────────────────────────────┐
//!   │                    TickController                      │
//!   └──┬──────────┬──────────┬───────────┬──────────┬────────┘
//!      │          │          │           │          │
//!  ClockSource TickDevice TimerWheel  SchedHooks  CpuAccounting
//!               Timekeeping DeferredWork          QuiescentHooks
//! ```

use bitflags::bitflags;

use crate::time::{Duration, Jiffies, Timestamp};
use crate::CpuId;

// =============================================================================
// CLOCK & TIMER HARDWARE
// =============================================================================

/// Monotonic clock
pub trait ClockSource {
    /// Current monotonic time
    fn now(&self) -> Timestamp;
}

/// Per-CPU clock event device
pub trait TickDevice {
    /// Program the device of `cpu` to fire at `deadline`.
    ///
    /// Returns `false` if the deadline has already passed; the device is
    /// left unprogrammed in that case.
    fn arm(&self, cpu: CpuId, deadline: Timestamp) -> bool;

    /// Cancel any pending event on `cpu`
    fn cancel(&self, cpu: CpuId);

    /// Is an event pending on `cpu`?
    fn is_active(&self, cpu: CpuId) -> bool;

    /// Programmed expiry of `cpu`, [`Timestamp::MAX`] when idle
    fn current_expiry(&self, cpu: CpuId) -> Timestamp;

    /// Switch `cpu`'s device to oneshot mode. False if not possible.
    fn switch_to_oneshot(&self, cpu: CpuId) -> bool;

    /// Can `cpu`'s device run in oneshot mode?
    fn oneshot_available(&self, cpu: CpuId) -> bool;

    /// Re-check a pending oneshot broadcast on interrupt entry
    fn check_oneshot_broadcast(&self, _cpu: CpuId) {}
}

/// Timer wheel query
pub trait TimerWheel {
    /// Jiffy of the next pending timer on `cpu` at or after `from`.
    ///
    /// `from + NEXT_TIMER_MAX_DELTA` (or later) means nothing is pending
    /// in the foreseeable future.
    fn next_pending_expiry(&self, cpu: CpuId, from: Jiffies) -> Jiffies;
}

/// Wall-clock timekeeping
pub trait Timekeeping {
    /// Longest the clocksource can go without an update before wrapping
    fn max_deferment(&self) -> Duration;

    /// Is the current clocksource good enough for high resolution mode?
    fn valid_for_hres(&self) -> bool;

    /// Account `ticks` elapsed periods to wall time
    fn do_timer(&self, ticks: u64);
}

// =============================================================================
// DEFERRED WORK
// =============================================================================

bitflags! {
    /// Deferred work that needs the next tick on a CPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NeedsCpu: u8 {
        /// RCU callbacks waiting for a grace period
        const RCU    = 1 << 0;
        /// Buffered log output
        const PRINTK = 1 << 1;
        /// Architecture-specific reasons
        const ARCH   = 1 << 2;
    }
}

/// Deferred-work probes
pub trait DeferredWork {
    /// Which kinds of deferred work need a wakeup on `cpu` one tick ahead
    fn needs_cpu(&self, cpu: CpuId) -> NeedsCpu;

    /// Does RCU have work for `cpu` right now?
    fn rcu_pending(&self, cpu: CpuId) -> bool;

    /// Pending softirq bits on `cpu`
    fn softirq_pending(&self, cpu: CpuId) -> u32;

    /// Raise the timer softirq on `cpu`
    fn raise_timer_softirq(&self, cpu: CpuId);
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// What is running on a CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunningUnit {
    /// The idle task
    pub is_idle: bool,
    /// A kernel thread without a user address space
    pub kernel_only: bool,
}

/// Scheduler hooks
pub trait SchedHooks {
    /// Is a reschedule pending on `cpu`?
    fn need_resched(&self, cpu: CpuId) -> bool;

    /// Can the run queue of `cpu` live without the tick?
    fn can_stop_tick(&self, cpu: CpuId) -> bool;

    /// Task currently running on `cpu`
    fn current(&self, cpu: CpuId) -> RunningUnit;

    /// Privilege level of the interrupted context: `Some(true)` for user
    /// mode, `None` outside interrupt context.
    fn irq_user_mode(&self, cpu: CpuId) -> Option<bool>;

    /// Is `cpu` online?
    fn cpu_online(&self, cpu: CpuId) -> bool;

    /// Tasks waiting on I/O that last ran on `cpu`
    fn nr_iowait(&self, cpu: CpuId) -> usize;

    /// Idle load balancer notification
    fn nohz_balancer(&self, cpu: CpuId, idle: bool);

    /// Mark the scheduler domains of `cpu` idle
    fn set_sd_state_idle(&self, cpu: CpuId);

    /// Set or clear the "no periodic tick" marker of the current task
    fn set_nohz_marker(&self, cpu: CpuId, on: bool);

    /// Is a posix CPU timer armed on the current task?
    fn posix_timers_running(&self, cpu: CpuId) -> bool;

    /// Is `cpu` part of an adaptive nohz cpuset?
    fn in_adaptive_set(&self, cpu: CpuId) -> bool;

    /// Keep the lockup watchdog quiet across a long tickless period
    fn touch_watchdog(&self, _cpu: CpuId) {}

    /// Scheduler clock notification on idle entry
    fn sched_clock_idle_sleep(&self, _cpu: CpuId) {}

    /// Scheduler clock notification on idle exit
    fn sched_clock_idle_wakeup(&self, _cpu: CpuId) {}

    /// Profiling hook run on every tick
    fn profile_tick(&self, _cpu: CpuId) {}
}

// =============================================================================
// ACCOUNTING
// =============================================================================

/// CPU time accounting sinks
pub trait CpuAccounting {
    /// Credit `ticks` idle ticks to `cpu`
    fn account_idle_ticks(&self, cpu: CpuId, ticks: u64);

    /// Credit `ticks` user ticks to the current task of `cpu`
    fn account_user_ticks(&self, cpu: CpuId, ticks: u64);

    /// Credit `ticks` system ticks to the current task of `cpu`
    fn account_system_ticks(&self, cpu: CpuId, ticks: u64);

    /// Periodic per-tick process accounting
    fn update_process_times(&self, cpu: CpuId, user: bool);
}

/// RCU extended quiescent state hooks
pub trait QuiescentHooks {
    /// Enter the extended quiescent state for user execution
    fn user_enter(&self, cpu: CpuId, from_irq: bool);

    /// Leave the extended quiescent state
    fn user_exit(&self, cpu: CpuId, from_irq: bool);
}

// =============================================================================
// PLATFORM
// =============================================================================

/// Every collaborator the controller needs
pub trait Platform:
    ClockSource
    + TickDevice
    + TimerWheel
    + Timekeeping
    + DeferredWork
    + SchedHooks
    + CpuAccounting
    + QuiescentHooks
    + Send
    + Sync
{
}

impl<T> Platform for T where
    T: ClockSource
        + TickDevice
        + TimerWheel
        + Timekeeping
        + DeferredWork
        + SchedHooks
        + CpuAccounting
        + QuiescentHooks
        + Send
        + Sync
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_cpu_flags() {
        let needs = NeedsCpu::RCU | NeedsCpu::ARCH;
        assert!(needs.contains(NeedsCpu::RCU));
        assert!(!needs.contains(NeedsCpu::PRINTK));
        assert!(NeedsCpu::default().is_empty());
    }
}
