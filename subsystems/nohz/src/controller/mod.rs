//! # Tick Controller
//!
//! Ties the per-CPU tick records, the jiffies clock and the duty arbiter
//! together. Every entry point takes the CPU it runs on; the caller
//! guarantees that the CPU-local ones are only invoked by that CPU.
//!
//! ```text
//!   idle loop ──▶ idle_enter / idle_exit ─┐
//!   irq entry ──▶ check_idle              │      ┌──────────────┐
//!   irq exit  ──▶ irq_exit ───────────────┼─────▶│ stop/restart │──▶ TickDevice
//!   syscalls  ──▶ enter/exit_kernel ──────┤      └──────┬───────┘
//!   scheduler ──▶ pre/post_schedule ──────┘             │
//!                                           DutyArbiter ◀┴▶ JiffiesClock
//! ```
//!
//! The submodules split the entry points by caller:
//!
//! - `idle`: idle loop and interrupt boundary, stop/restart machinery
//! - `adaptive`: busy-tickless mode for a CPU running a single task
//! - `handler`: the emulated tick itself, its setup and teardown

mod adaptive;
mod handler;
mod idle;

use alloc::vec::Vec;

use crate::config::{NohzConfig, NohzDomains};
use crate::diag::RateLimit;
use crate::duty::{DutyArbiter, DutyView};
use crate::error::{NohzError, NohzResult};
use crate::jiffies::JiffiesClock;
use crate::platform::Platform;
use crate::tick_sched::{CpuTickState, NohzMode, TickSched, TickStats};
use crate::time::{Duration, Jiffies, Timestamp};
use crate::{CpuId, MAX_CPUS};

/// Re-arm attempts before a programming loop gives up
pub const MAX_ARM_RETRIES: u32 = 64;

/// Tickless scheduling-clock controller
pub struct TickController<P: Platform> {
    config: NohzConfig,
    platform: P,
    jiffies: JiffiesClock,
    duty: DutyArbiter,
    cpus: Vec<CpuTickState>,
    domains: NohzDomains,
    softirq_reports: RateLimit,
}

impl<P: Platform> TickController<P> {
    /// Create a controller for `nr_cpus` CPUs
    pub fn new(config: NohzConfig, platform: P, nr_cpus: usize) -> NohzResult<Self> {
        config.validate()?;
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err(NohzError::InvalidCpuCount {
                requested: nr_cpus,
                max: MAX_CPUS,
            });
        }

        let jiffies = JiffiesClock::new(config.tick_period);
        jiffies.set_next_period(platform.now());

        log::info!(
            "NOHZ: {} CPUs, tick period {} us, {:?} duty policy{}",
            nr_cpus,
            config.tick_period.as_micros(),
            config.policy,
            if config.enabled { "" } else { ", tickless disabled" }
        );

        Ok(Self {
            jiffies,
            duty: DutyArbiter::new(config.policy),
            cpus: (0..nr_cpus).map(|_| CpuTickState::new()).collect(),
            domains: NohzDomains::new(&config, nr_cpus),
            softirq_reports: RateLimit::new(config.softirq_report_limit),
            config,
            platform,
        })
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn config(&self) -> &NohzConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn tick_period(&self) -> Duration {
        self.config.tick_period
    }

    /// Global tick count
    pub fn jiffies(&self) -> Jiffies {
        self.jiffies.jiffies()
    }

    pub fn jiffies_clock(&self) -> &JiffiesClock {
        &self.jiffies
    }

    /// CPU currently advancing global time
    pub fn duty_owner(&self) -> Option<CpuId> {
        self.duty.owner()
    }

    pub fn duty(&self) -> &DutyArbiter {
        &self.duty
    }

    pub fn domains(&self) -> &NohzDomains {
        &self.domains
    }

    fn state(&self, cpu: CpuId) -> &CpuTickState {
        &self.cpus[cpu]
    }

    fn checked_state(&self, cpu: CpuId) -> NohzResult<&CpuTickState> {
        self.cpus.get(cpu).ok_or(NohzError::CpuOutOfRange {
            cpu,
            nr_cpus: self.cpus.len(),
        })
    }

    // =========================================================================
    // SHARED HELPERS
    // =========================================================================

    /// Bring jiffies up to date and feed the elapsed ticks to timekeeping
    fn update_jiffies(&self, now: Timestamp) {
        let ticks = self.jiffies.advance_if_due(now);
        if ticks > 0 {
            self.platform.do_timer(ticks);
        }
    }

    /// Program the emulated tick of `cpu` for `deadline`.
    ///
    /// False when the deadline had already passed.
    fn program(&self, cpu: CpuId, ts: &mut TickSched, deadline: Timestamp) -> bool {
        ts.sched_timer = deadline;
        let armed = self.platform.arm(cpu, deadline);
        match ts.nohz_mode {
            NohzMode::HighRes => armed && self.platform.is_active(cpu),
            _ => armed,
        }
    }

    /// Forward the emulated tick past `now` and arm it, catching up on
    /// jiffies whenever the programmed period turns out to be over already
    fn rearm_periodic(&self, cpu: CpuId, ts: &mut TickSched, mut now: Timestamp) {
        for _ in 0..MAX_ARM_RETRIES {
            ts.sched_timer.forward(now, self.config.tick_period);
            let expiry = ts.sched_timer;
            if self.program(cpu, ts, expiry) {
                return;
            }
            self.update_jiffies(now);
            now = self.platform.now();
        }
        crate::warn_on_once!(
            true,
            "CPU {}: tick not rearmed after {} attempts",
            cpu,
            MAX_ARM_RETRIES
        );
    }

    fn election(&self, cpu: CpuId) -> Election<'_, P> {
        Election { ctl: self, cpu }
    }

    /// Count `cpu` in the busy-tickless population
    fn enlist_adaptive(&self, cpu: CpuId) {
        if !self.state(cpu).set_user_nohz(true) {
            self.duty.population().enter();
        }
    }

    /// Remove `cpu` from the busy-tickless population
    fn withdraw_adaptive(&self, cpu: CpuId) {
        if self.state(cpu).set_user_nohz(false) {
            self.duty.population().leave();
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Cumulative idle time of `cpu` in microseconds, `None` when tickless
    /// mode is disabled.
    ///
    /// With `update` the open idle interval is closed and restarted at the
    /// current time; otherwise it is only peeked at.
    pub fn idle_time_us(&self, cpu: CpuId, update: bool) -> NohzResult<Option<u64>> {
        let state = self.checked_state(cpu)?;
        if !self.config.enabled {
            return Ok(None);
        }

        let now = self.platform.now();
        let iowait = self.platform.nr_iowait(cpu) > 0;
        let idle = if update {
            let mut acct = state.idle().write();
            acct.update(now, iowait);
            acct.idle_sleep
        } else {
            state.idle().read().idle_at(now, iowait)
        };

        Ok(Some(state.clamp_idle(idle.as_micros())))
    }

    /// Cumulative iowait time of `cpu` in microseconds, `None` when
    /// tickless mode is disabled
    pub fn iowait_time_us(&self, cpu: CpuId, update: bool) -> NohzResult<Option<u64>> {
        let state = self.checked_state(cpu)?;
        if !self.config.enabled {
            return Ok(None);
        }

        let now = self.platform.now();
        let iowait = self.platform.nr_iowait(cpu) > 0;
        let total = if update {
            let mut acct = state.idle().write();
            acct.update(now, iowait);
            acct.iowait_sleep
        } else {
            state.idle().read().iowait_at(now, iowait)
        };

        Ok(Some(state.clamp_iowait(total.as_micros())))
    }

    /// Length of the sleep programmed by the last stop evaluation
    pub fn sleep_length(&self, cpu: CpuId) -> NohzResult<Duration> {
        Ok(self.checked_state(cpu)?.lock().sleep_length)
    }

    /// Diagnostic snapshot of `cpu`'s tick record
    pub fn tick_stats(&self, cpu: CpuId) -> NohzResult<TickStats> {
        let state = self.checked_state(cpu)?;
        let ts = state.lock();
        Ok(TickStats::capture(state, &ts))
    }
}

impl<P: Platform> core::fmt::Debug for TickController<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TickController")
            .field("config", &self.config)
            .field("nr_cpus", &self.cpus.len())
            .field("jiffies", &self.jiffies.snapshot())
            .field("duty", &self.duty)
            .finish()
    }
}

/// The arbiter's view of the system from one CPU
struct Election<'a, P: Platform> {
    ctl: &'a TickController<P>,
    cpu: CpuId,
}

impl<P: Platform> DutyView for Election<'_, P> {
    fn is_adaptive(&self, cpu: CpuId) -> bool {
        self.ctl.cpus.get(cpu).is_some_and(CpuTickState::user_nohz)
    }

    fn may_take_from_adaptive(&self) -> bool {
        self.ctl.platform.current(self.cpu).is_idle || !self.ctl.platform.in_adaptive_set(self.cpu)
    }
}

// =============================================================================
// TESTS
// =============================================================================
