//! # Idle Tick State Machine
//!
//! ```text
//!                 idle_enter / irq_exit (in idle)
//!   ┌─────────┐  next event > 1 tick away       ┌─────────┐
//!   │ Ticking │ ──────────────────────────────▶ │ Stopped │ ◀─┐ re-evaluate
//!   └─────────┘  and duty not needed here       └─────────┘ ──┘ on irq_exit
//!        ▲                                           │
//!        └──────────── idle_exit / restart ──────────┘
//!              jiffies caught up, last_tick restored,
//!              skipped ticks credited to their bucket
//! ```

use crate::duty::DutyOutcome;
use crate::platform::Platform;
use crate::tick_sched::{JiffiesWhence, NohzMode, TickSched};
use crate::time::{Duration, Timestamp, NEXT_TIMER_MAX_DELTA};
use crate::warn_on_once;
use crate::CpuId;

use super::{TickController, MAX_ARM_RETRIES};

impl<P: Platform> TickController<P> {
    // =========================================================================
    // STOP
    // =========================================================================

    /// Try to stop the tick of `cpu` until its next pending event.
    ///
    /// Returns the programmed expiry when the device was (re)programmed,
    /// [`Timestamp::MAX`] meaning "no event at all".
    pub(super) fn stop_sched_tick(
        &self,
        cpu: CpuId,
        ts: &mut TickSched,
        now: Timestamp,
    ) -> Option<Timestamp> {
        let snapshot = self.jiffies.snapshot();
        let last_update = snapshot.last_update;
        let last_jiffies = snapshot.jiffies;
        let mut time_delta = self.platform.max_deferment();

        let (next_jiffies, delta_jiffies) = if !self.platform.needs_cpu(cpu).is_empty() {
            (last_jiffies.wrapping_add(1), 1)
        } else {
            let next = self.platform.next_pending_expiry(cpu, last_jiffies);
            (next, next.wrapping_sub(last_jiffies))
        };

        let mut programmed = None;

        'out: {
            // One tick off is not worth stopping for
            if !ts.tick_stopped && delta_jiffies == 1 {
                break 'out;
            }

            if (delta_jiffies as i64) >= 1 {
                let prev_owner = self.duty.owner();
                let outcome = self.duty.try_drop_or_reassign(cpu, &self.election(cpu));
                if outcome == DutyOutcome::Acquired {
                    break 'out;
                }

                // The last timekeeper may not sleep past the point where
                // the clocksource wraps; anyone else may sleep forever.
                if prev_owner == Some(cpu) {
                    ts.do_timer_last = true;
                } else if let DutyOutcome::Retained(_) = outcome {
                    time_delta = Duration::MAX;
                    ts.do_timer_last = false;
                } else if !ts.do_timer_last {
                    time_delta = Duration::MAX;
                }

                if delta_jiffies < NEXT_TIMER_MAX_DELTA {
                    time_delta = time_delta.min(self.config.tick_period.saturating_mul(delta_jiffies));
                }

                let expires = if time_delta < Duration::MAX {
                    last_update.saturating_add(time_delta)
                } else {
                    Timestamp::MAX
                };

                if ts.tick_stopped && expires == self.platform.current_expiry(cpu) {
                    break 'out;
                }

                programmed = Some(expires);

                if !ts.tick_stopped {
                    ts.last_tick = ts.sched_timer;
                    ts.tick_stopped = true;
                    log::trace!("NOHZ: CPU {} stopped tick", cpu);
                }

                if expires.is_max() {
                    if ts.nohz_mode == NohzMode::HighRes {
                        self.platform.cancel(cpu);
                    }
                    break 'out;
                }

                if self.program(cpu, ts, expires) {
                    break 'out;
                }

                // Crossed a jiffy boundary while deciding
                programmed = Some(self.arm_next_period(cpu, ts));
            }

            self.platform.raise_timer_softirq(cpu);
        }

        ts.next_jiffies = next_jiffies;
        ts.last_jiffies = last_jiffies;
        ts.sleep_length = self.platform.current_expiry(cpu).duration_since(now);

        programmed
    }

    /// Stop path fallback after a missed deadline: catch up on jiffies and
    /// arm the next period boundary
    fn arm_next_period(&self, cpu: CpuId, ts: &mut TickSched) -> Timestamp {
        let mut deadline = ts.sched_timer;
        for _ in 0..MAX_ARM_RETRIES {
            self.update_jiffies(self.platform.now());
            deadline = self.jiffies.snapshot().next_period;
            if self.program(cpu, ts, deadline) {
                return deadline;
            }
        }
        warn_on_once!(true, "CPU {}: stopped tick not armed after {} attempts", cpu, MAX_ARM_RETRIES);
        deadline
    }

    /// May the idle tick of `cpu` be stopped right now?
    fn can_stop_idle_tick(&self, cpu: CpuId, ts: &TickSched) -> bool {
        let online = self.platform.cpu_online(cpu);

        // An offline CPU must not keep the duty: nobody would update
        // jiffies until it comes back.
        if !online {
            self.duty.clear_if_owner(cpu);
        }

        if ts.nohz_mode == NohzMode::Inactive {
            return false;
        }

        if self.platform.need_resched(cpu) {
            return false;
        }

        let pending = self.platform.softirq_pending(cpu);
        if pending != 0 && online {
            if self.softirq_reports.allow() {
                log::error!("NOHZ: local_softirq_pending {:02x}", pending);
            }
            return false;
        }

        true
    }

    // =========================================================================
    // IDLE ACCOUNTING
    // =========================================================================

    fn start_idle(&self, cpu: CpuId) -> Timestamp {
        let now = self.platform.now();
        let iowait = self.platform.nr_iowait(cpu) > 0;

        self.state(cpu).idle().write().start(now, iowait);
        self.withdraw_adaptive(cpu);
        self.platform.sched_clock_idle_sleep(cpu);

        now
    }

    fn stop_idle(&self, cpu: CpuId, now: Timestamp) {
        let iowait = self.platform.nr_iowait(cpu) > 0;

        self.state(cpu).idle().write().stop(now, iowait);
        self.platform.sched_clock_idle_wakeup(cpu);
    }

    // =========================================================================
    // IDLE LOOP
    // =========================================================================

    /// Idle loop entry: start idle accounting and stop the tick if possible
    pub fn idle_enter(&self, cpu: CpuId) {
        // Scheduler domains go busy again on the first busy tick
        self.platform.set_sd_state_idle(cpu);

        let mut ts = self.state(cpu).lock();
        // Set even when tickless is off: frequency governors rely on the
        // idle accounting started below.
        ts.inidle = true;
        self.idle_enter_locked(cpu, &mut ts);
    }

    fn idle_enter_locked(&self, cpu: CpuId, ts: &mut TickSched) {
        let now = self.start_idle(cpu);

        if !self.can_stop_idle_tick(cpu, ts) {
            return;
        }

        let was_stopped = ts.tick_stopped;
        ts.idle_calls += 1;

        if let Some(expires) = self.stop_sched_tick(cpu, ts, now) {
            ts.idle_sleeps += 1;
            ts.idle_expires = expires;
        }

        if !was_stopped && ts.tick_stopped {
            ts.saved_jiffies = ts.last_jiffies;
            ts.saved_whence = JiffiesWhence::Idle;
            self.platform.nohz_balancer(cpu, true);
        }
    }

    /// Idle loop exit: close idle accounting, restart the tick and credit
    /// the ticks skipped while idle
    pub fn idle_exit(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();

        warn_on_once!(!ts.inidle, "CPU {}: idle exit outside the idle loop", cpu);
        ts.inidle = false;

        let idle_active = self.state(cpu).idle_active();
        if !idle_active && !ts.tick_stopped {
            return;
        }

        let now = self.platform.now();

        if idle_active {
            self.stop_idle(cpu, now);
        }

        if ts.tick_stopped {
            self.platform.nohz_balancer(cpu, false);
            self.restart_sched_tick_locked(cpu, &mut ts, now);
            self.account_ticks(cpu, &ts);
            ts.saved_whence = JiffiesWhence::None;
        }
    }

    // =========================================================================
    // INTERRUPT BOUNDARY
    // =========================================================================

    /// Interrupt entry: an interrupt handler must not see stale jiffies
    pub fn check_idle(&self, cpu: CpuId) {
        self.platform.check_oneshot_broadcast(cpu);

        let mut ts = self.state(cpu).lock();
        let idle_active = self.state(cpu).idle_active();
        if !idle_active && !ts.tick_stopped {
            return;
        }

        let now = self.platform.now();

        if idle_active {
            self.stop_idle(cpu, now);
        }

        if ts.tick_stopped {
            ts.idle_waketime = now;
            self.update_jiffies(now);
            self.platform.touch_watchdog(cpu);
        }
    }

    /// Interrupt exit: the handler may have queued timers or callbacks, so
    /// the next event is recomputed
    pub fn irq_exit(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();

        if ts.inidle {
            if !self.platform.need_resched(cpu) {
                self.idle_enter_locked(cpu, &mut ts);
            }
        } else {
            self.stop_adaptive_tick(cpu, &mut ts);
        }
    }

    // =========================================================================
    // RESTART
    // =========================================================================

    /// Restart the tick of a tickless CPU and credit the ticks it skipped;
    /// no-op when it is ticking
    pub fn restart_sched_tick(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        if !ts.tick_stopped {
            return;
        }

        self.restart_if_stopped(cpu, &mut ts);
        self.account_ticks(cpu, &ts);
        ts.saved_whence = JiffiesWhence::None;
    }

    pub(super) fn restart_if_stopped(&self, cpu: CpuId, ts: &mut TickSched) {
        if !ts.tick_stopped {
            return;
        }
        let now = self.platform.now();
        self.restart_sched_tick_locked(cpu, ts, now);
    }

    fn restart_sched_tick_locked(&self, cpu: CpuId, ts: &mut TickSched, now: Timestamp) {
        self.update_jiffies(now);
        self.platform.touch_watchdog(cpu);

        ts.tick_stopped = false;
        ts.idle_exittime = now;

        self.platform.cancel(cpu);
        ts.sched_timer = ts.last_tick;
        self.rearm_periodic(cpu, ts, now);

        log::trace!("NOHZ: CPU {} restarted tick", cpu);
    }

    /// Credit the ticks skipped since `saved_jiffies` to the saved bucket
    pub(super) fn account_ticks(&self, cpu: CpuId, ts: &TickSched) {
        let ticks = self.jiffies.jiffies().wrapping_sub(ts.saved_jiffies);

        // Possibly one off; never credit a wrapped difference
        if ticks == 0 || ticks >= i64::MAX as u64 {
            return;
        }

        match ts.saved_whence {
            JiffiesWhence::Idle => self.platform.account_idle_ticks(cpu, ticks),
            JiffiesWhence::User => self.platform.account_user_ticks(cpu, ticks),
            JiffiesWhence::System => self.platform.account_system_ticks(cpu, ticks),
            JiffiesWhence::None => {},
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::config::NohzConfig;
    use crate::testing::MockPlatform;
    use crate::tick_sched::{JiffiesWhence, NohzMode};
    use crate::time::{Duration, Timestamp};
    use crate::TickController;

    const PERIOD: Duration = Duration::from_millis(10);

    /// Two CPUs in high resolution mode; CPU 1 holds the timer duty
    fn controller() -> TickController<MockPlatform> {
        let ctl = TickController::new(NohzConfig::default(), MockPlatform::new(2), 2).unwrap();
        ctl.setup_sched_timer(0);
        ctl.setup_sched_timer(1);
        ctl.duty().claim_if_vacant(1);
        ctl
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    #[test]
    fn test_idle_stop_until_next_timer() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);

        ctl.idle_enter(0);

        let stats = ctl.tick_stats(0).unwrap();
        assert!(stats.tick_stopped);
        assert_eq!(stats.idle_sleeps, 1);
        assert_eq!(stats.idle_calls, 1);
        assert_eq!(stats.idle_expires, ms(500));
        assert_eq!(stats.saved_whence, JiffiesWhence::Idle);
        assert_eq!(stats.last_tick, ms(10));
        assert_eq!(platform.expiry(0), ms(500));
        assert_eq!(ctl.sleep_length(0), Ok(Duration::from_millis(500)));
        assert!(platform.balancer_idle(0));
        assert_eq!(platform.sd_idle_calls(0), 1);
    }

    #[test]
    fn test_idle_stop_capped_for_last_timekeeper() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);
        platform.set_max_deferment(Duration::from_millis(200));

        ctl.duty().clear_if_owner(1);
        ctl.duty().claim_if_vacant(0);

        ctl.idle_enter(0);

        assert_eq!(ctl.duty_owner(), None);
        assert_eq!(platform.expiry(0), ms(200));
        assert_eq!(ctl.tick_stats(0).unwrap().idle_expires, ms(200));
    }

    #[test]
    fn test_no_stop_when_one_tick_away() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(1);

        ctl.idle_enter(0);

        let stats = ctl.tick_stats(0).unwrap();
        assert!(!stats.tick_stopped);
        assert_eq!(stats.idle_calls, 1);
        assert_eq!(stats.idle_sleeps, 0);
        assert_eq!(stats.saved_whence, JiffiesWhence::None);
        assert_eq!(platform.expiry(0), ms(10));
    }

    #[test]
    fn test_deferred_work_keeps_tick() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);
        platform.set_needs_cpu(crate::platform::NeedsCpu::RCU);

        ctl.idle_enter(0);
        assert!(!ctl.tick_stats(0).unwrap().tick_stopped);
    }

    #[test]
    fn test_no_stop_without_nohz_mode() {
        let config = NohzConfig::default().with_enabled(false);
        let ctl = TickController::new(config, MockPlatform::new(1), 1).unwrap();
        ctl.setup_sched_timer(0);
        ctl.platform().set_next_timer_in(50);

        ctl.idle_enter(0);

        let stats = ctl.tick_stats(0).unwrap();
        assert_eq!(stats.nohz_mode, NohzMode::Inactive);
        assert!(!stats.tick_stopped);
        assert_eq!(stats.idle_calls, 0);
        assert!(stats.inidle);
        assert!(stats.idle_active);
    }

    #[test]
    fn test_pending_softirq_declines_and_rate_limits() {
        let config = NohzConfig::default().with_softirq_report_limit(2);
        let ctl = TickController::new(config, MockPlatform::new(1), 1).unwrap();
        ctl.setup_sched_timer(0);
        ctl.platform().set_next_timer_in(50);
        ctl.platform().set_softirq_pending(0x08);

        for _ in 0..5 {
            ctl.idle_enter(0);
            assert!(!ctl.tick_stats(0).unwrap().tick_stopped);
        }
        assert_eq!(ctl.softirq_reports.emitted(), 2);
    }

    #[test]
    fn test_offline_cpu_drops_duty() {
        let ctl = controller();
        ctl.platform().set_online(1, false);
        ctl.platform().set_need_resched(true);

        ctl.idle_enter(1);
        assert_eq!(ctl.duty_owner(), None);
    }

    #[test]
    fn test_idle_exit_restarts_and_accounts() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);

        ctl.idle_enter(0);
        assert!(ctl.tick_stats(0).unwrap().tick_stopped);

        platform.set_now(ms(123));
        ctl.idle_exit(0);

        let stats = ctl.tick_stats(0).unwrap();
        assert!(!stats.tick_stopped);
        assert!(!stats.inidle);
        assert!(!stats.idle_active);
        assert_eq!(stats.saved_whence, JiffiesWhence::None);
        assert_eq!(stats.idle_sleep, Duration::from_millis(123));

        // Tick realigned to the period grid from the saved last tick
        assert_eq!(platform.expiry(0), ms(130));
        assert_eq!(ctl.jiffies(), 12);
        assert_eq!(platform.idle_ticks(0), 12);
        assert_eq!(platform.do_timer_ticks(), 12);
        assert!(!platform.balancer_idle(0));
    }

    #[test]
    fn test_restart_on_running_tick_is_noop() {
        let ctl = controller();
        let platform = ctl.platform();
        let before = ctl.tick_stats(0).unwrap();
        let arms = platform.arm_count(0);

        platform.set_now(ms(55));
        ctl.restart_sched_tick(0);
        ctl.restart_sched_tick(0);

        assert_eq!(ctl.tick_stats(0).unwrap(), before);
        assert_eq!(platform.arm_count(0), arms);
        assert_eq!(ctl.jiffies(), 0);
        assert_eq!(platform.idle_ticks(0), 0);
    }

    #[test]
    fn test_restart_credits_skipped_ticks() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);

        ctl.idle_enter(0);
        let start = ctl.jiffies();

        platform.set_now(ms(100));
        ctl.restart_sched_tick(0);

        let stats = ctl.tick_stats(0).unwrap();
        assert!(!stats.tick_stopped);
        assert_eq!(stats.saved_whence, JiffiesWhence::None);
        assert_eq!(ctl.jiffies() - start, 10);
        assert_eq!(platform.idle_ticks(0), 10);

        // Leaving idle afterwards must not credit anything again
        ctl.idle_exit(0);

        assert_eq!(ctl.tick_stats(0).unwrap().saved_whence, JiffiesWhence::None);
        assert_eq!(
            platform.idle_ticks(0) + platform.user_ticks(0) + platform.system_ticks(0),
            ctl.jiffies() - start
        );
    }

    #[test]
    fn test_restart_retry_terminates_with_advancing_clock() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);
        ctl.idle_enter(0);

        platform.set_now(ms(95));
        platform.set_auto_advance(Duration::from_millis(7));
        platform.reject_arms(0, 5);
        let arms = platform.arm_count(0);

        ctl.idle_exit(0);

        assert!(!ctl.tick_stats(0).unwrap().tick_stopped);
        assert_eq!(platform.arm_count(0), arms + 6);
        let now = platform.peek();
        assert!(platform.expiry(0) > now);
        assert!(platform.expiry(0).as_nanos() - now.as_nanos() <= PERIOD.as_nanos());
    }

    #[test]
    fn test_stop_past_deadline_catches_up() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(3);
        platform.set_now(ms(47));
        platform.reject_arms(0, 2);

        ctl.idle_enter(0);

        let stats = ctl.tick_stats(0).unwrap();
        assert!(stats.tick_stopped);
        assert_eq!(ctl.jiffies(), 4);
        assert_eq!(platform.expiry(0), ms(50));
        assert_eq!(stats.idle_expires, ms(50));
        assert_eq!(platform.softirq_raised(0), 1);
    }

    #[test]
    fn test_irq_exit_reevaluates_in_idle() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);
        ctl.idle_enter(0);

        // An interrupt queued an earlier timer
        ctl.check_idle(0);
        platform.set_next_timer_in(20);
        ctl.irq_exit(0);

        let stats = ctl.tick_stats(0).unwrap();
        assert!(stats.tick_stopped);
        assert_eq!(stats.idle_sleeps, 2);
        assert_eq!(platform.expiry(0), ms(200));
        assert_eq!(stats.last_tick, ms(10));
        assert_eq!(stats.saved_whence, JiffiesWhence::Idle);
    }

    #[test]
    fn test_irq_exit_same_expiry_skips_reprogram() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);
        ctl.idle_enter(0);
        let arms = platform.arm_count(0);

        ctl.irq_exit(0);

        assert_eq!(platform.arm_count(0), arms);
        assert_eq!(ctl.tick_stats(0).unwrap().idle_sleeps, 1);
    }

    #[test]
    fn test_check_idle_updates_jiffies() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(50);
        ctl.idle_enter(0);

        platform.set_now(ms(75));
        ctl.check_idle(0);

        assert_eq!(ctl.jiffies(), 7);
        let stats = ctl.tick_stats(0).unwrap();
        assert!(!stats.idle_active);
        assert_eq!(stats.idle_sleep, Duration::from_millis(75));
    }

    #[test]
    fn test_accounting_conservation() {
        let ctl = controller();
        let platform = ctl.platform();
        platform.set_next_timer_in(1_000);

        ctl.idle_enter(0);
        let start = ctl.jiffies();

        for step in 1..=9u64 {
            platform.set_now(ms(step * 37));
            ctl.check_idle(0);
            ctl.irq_exit(0);
        }
        platform.set_now(ms(400));
        ctl.idle_exit(0);

        let elapsed = ctl.jiffies() - start;
        assert_eq!(elapsed, 40);
        assert_eq!(
            platform.idle_ticks(0) + platform.user_ticks(0) + platform.system_ticks(0),
            elapsed
        );
    }
}
