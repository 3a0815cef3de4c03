//! # Adaptive (busy) Tickless Mode
//!
//! A CPU in an adaptive nohz set that runs a single task may stop its tick
//! while busy. Stopping is only done from user mode (or for kernel threads):
//! the skipped ticks are later credited to user or system time depending on
//! where the task was, so the starting point must be unambiguous.
//!
//! ```text
//!   irq_exit (user mode) ──▶ stopped, bucket = User, extended QS entered
//!        enter_kernel    ──▶ credit User ticks, bucket = System
//!        exit_kernel     ──▶ credit System ticks, bucket = User
//!   check_adaptive / IPI ──▶ not eligible anymore: flush and restart
//!   pre_schedule         ──▶ flush only (run queue lock held)
//!   post_schedule        ──▶ idle task: bucket = Idle, else restart
//! ```

use crate::platform::Platform;
use crate::tick_sched::{JiffiesWhence, NohzMode, TickSched};
use crate::warn_on_once;
use crate::CpuId;

use super::TickController;

impl<P: Platform> TickController<P> {
    /// Can the task on `cpu` keep running without the tick? Keeps the
    /// busy-tickless population in sync with the answer.
    fn can_stop_adaptive_tick(&self, cpu: CpuId) -> bool {
        let ok = self.platform.can_stop_tick(cpu)
            && !self.platform.posix_timers_running(cpu)
            && !self.platform.rcu_pending(cpu);

        if ok {
            self.enlist_adaptive(cpu);
        } else {
            self.withdraw_adaptive(cpu);
        }
        ok
    }

    /// Stop the tick of a busy CPU on interrupt exit, if it qualifies
    pub(super) fn stop_adaptive_tick(&self, cpu: CpuId, ts: &mut TickSched) {
        if !self.config.adaptive() || !self.platform.in_adaptive_set(cpu) {
            return;
        }

        let current = self.platform.current(cpu);
        if current.is_idle {
            return;
        }

        if !ts.tick_stopped && ts.nohz_mode == NohzMode::Inactive {
            return;
        }

        if !self.can_stop_adaptive_tick(cpu) {
            return;
        }

        // Only stop from user mode, or the first skipped ticks would be
        // charged to system time after a syscall exit hook already ran.
        let user = self.platform.irq_user_mode(cpu).unwrap_or(false);
        if !user && !current.kernel_only {
            return;
        }

        let was_stopped = ts.tick_stopped;
        let now = self.platform.now();
        self.stop_sched_tick(cpu, ts, now);

        if !was_stopped && ts.tick_stopped {
            warn_on_once!(
                ts.saved_whence != JiffiesWhence::None,
                "CPU {}: busy tick stopped with open bucket {:?}",
                cpu,
                ts.saved_whence
            );

            if user {
                ts.saved_whence = JiffiesWhence::User;
                ts.ext_qs = true;
                self.platform.user_enter(cpu, true);
            } else {
                ts.saved_whence = JiffiesWhence::System;
            }

            ts.saved_jiffies = self.jiffies.jiffies();
            self.platform.set_nohz_marker(cpu, true);
            log::trace!("NOHZ: CPU {} busy tickless", cpu);
        }
    }

    // =========================================================================
    // KERNEL BOUNDARY
    // =========================================================================

    /// Return to user space with the tick stopped
    pub fn exit_kernel(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        if !ts.tick_stopped {
            return;
        }

        if warn_on_once!(
            ts.saved_whence != JiffiesWhence::System,
            "CPU {}: kernel exit with bucket {:?}",
            cpu,
            ts.saved_whence
        ) {
            return;
        }

        let jiffies = self.jiffies.jiffies();
        let ticks = jiffies.wrapping_sub(ts.saved_jiffies);
        if ticks != 0 {
            self.platform.account_system_ticks(cpu, ticks);
        }

        ts.saved_jiffies = jiffies;
        ts.saved_whence = JiffiesWhence::User;
        ts.ext_qs = true;
        self.platform.user_enter(cpu, false);
    }

    /// Kernel entry from user space with the tick stopped
    pub fn enter_kernel(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        if !ts.tick_stopped {
            return;
        }

        if ts.ext_qs {
            ts.ext_qs = false;
            self.platform.user_exit(cpu, false);
        }

        if warn_on_once!(
            ts.saved_whence != JiffiesWhence::User,
            "CPU {}: kernel entry with bucket {:?}",
            cpu,
            ts.saved_whence
        ) {
            return;
        }

        let jiffies = self.jiffies.jiffies();
        let ticks = jiffies.wrapping_sub(ts.saved_jiffies);
        if ticks != 0 {
            self.platform.account_user_ticks(cpu, ticks);
        }

        ts.saved_jiffies = jiffies;
        ts.saved_whence = JiffiesWhence::System;
    }

    /// Exception entry; only a user-mode exception crosses into the kernel
    pub fn enter_exception(&self, cpu: CpuId, from_user: bool) {
        if from_user {
            self.enter_kernel(cpu);
        }
    }

    /// Exception return
    pub fn exit_exception(&self, cpu: CpuId, to_user: bool) {
        if to_user {
            self.exit_kernel(cpu);
        }
    }

    /// Leave the extended quiescent state entered on behalf of a user task
    pub fn cpu_exit_qs(&self, cpu: CpuId, from_irq: bool) {
        let mut ts = self.state(cpu).lock();
        self.exit_qs_locked(cpu, &mut ts, from_irq);
    }

    fn exit_qs_locked(&self, cpu: CpuId, ts: &mut TickSched, from_irq: bool) {
        if ts.ext_qs {
            self.platform.user_exit(cpu, from_irq);
            ts.ext_qs = false;
        }
    }

    // =========================================================================
    // LEAVING BUSY TICKLESS
    // =========================================================================

    fn restart_adaptive(&self, cpu: CpuId, ts: &mut TickSched) {
        self.flush_locked(cpu, ts, true);
        self.withdraw_adaptive(cpu);
        self.restart_if_stopped(cpu, ts);
        self.platform.set_nohz_marker(cpu, false);
        self.exit_qs_locked(cpu, ts, true);
    }

    /// Periodic eligibility re-check of a busy tickless CPU
    pub fn check_adaptive(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        if ts.tick_stopped
            && !self.platform.current(cpu).is_idle
            && !self.can_stop_adaptive_tick(cpu)
        {
            self.restart_adaptive(cpu, &mut ts);
        }
    }

    /// Another CPU found this one no longer eligible
    pub fn exit_nohz_ipi(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        if ts.tick_stopped && !self.platform.current(cpu).is_idle {
            self.restart_adaptive(cpu, &mut ts);
        }
    }

    /// Before a context switch: account the outgoing task. The tick is
    /// restarted in [`post_schedule`](Self::post_schedule), outside the run
    /// queue lock.
    pub fn pre_schedule(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        if ts.tick_stopped {
            self.flush_locked(cpu, &mut ts, true);
            self.platform.set_nohz_marker(cpu, false);
        }
    }

    /// After a context switch: keep sleeping if the idle task came in,
    /// otherwise restart the tick
    pub fn post_schedule(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        if !ts.tick_stopped {
            return;
        }

        if self.platform.current(cpu).is_idle {
            ts.saved_jiffies = self.jiffies.jiffies();
            ts.saved_whence = JiffiesWhence::Idle;
        } else {
            self.restart_if_stopped(cpu, &mut ts);
        }
    }

    /// Credit the ticks skipped so far. With `restart` the bucket is closed,
    /// otherwise a new interval starts now in the same bucket.
    pub fn flush_current_times(&self, cpu: CpuId, restart: bool) {
        let mut ts = self.state(cpu).lock();
        self.flush_locked(cpu, &mut ts, restart);
    }

    fn flush_locked(&self, cpu: CpuId, ts: &mut TickSched, restart: bool) {
        if !ts.tick_stopped {
            return;
        }

        self.account_ticks(cpu, ts);
        if restart {
            ts.saved_whence = JiffiesWhence::None;
        } else {
            ts.saved_jiffies = self.jiffies.jiffies();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
