//! # Tick Emulation
//!
//! The periodic tick runs in one of two ways once tickless mode is possible:
//!
//! - high resolution: a per-CPU timer rearmed by [`sched_timer_tick`]
//! - low resolution: the clock event device in oneshot mode, reprogrammed
//!   by [`lowres_tick`]
//!
//! Both keep the duty-owner check and the skipped-tick bookkeeping in one
//! place.
//!
//! [`sched_timer_tick`]: TickController::sched_timer_tick
//! [`lowres_tick`]: TickController::lowres_tick

use crate::platform::Platform;
use crate::tick_sched::{NohzMode, TickSched};
use crate::time::Timestamp;
use crate::warn_on_once;
use crate::CpuId;

use super::{TickController, MAX_ARM_RETRIES};

impl<P: Platform> TickController<P> {
    /// Advance jiffies if `cpu` keeps time, taking over a vacant duty first
    fn keep_time(&self, cpu: CpuId, now: Timestamp) {
        // A duty owner that went into a long sleep dropped the duty. Two CPUs
        // claiming it at once is harmless: jiffies updates are serialized.
        self.duty.claim_if_vacant(cpu);

        if self.duty.owner() == Some(cpu) {
            self.update_jiffies(now);
        }
    }

    fn account_tick(&self, cpu: CpuId, ts: &mut TickSched, user: bool) {
        // Ticks that still arrive while stopped are accounted right here;
        // move the reconciliation start so they are not credited twice.
        if ts.tick_stopped {
            self.platform.touch_watchdog(cpu);
            ts.saved_jiffies = ts.saved_jiffies.wrapping_add(1);
        }

        self.platform.update_process_times(cpu, user);
        self.platform.profile_tick(cpu);
    }

    /// High resolution tick callback. Returns the next expiry the caller
    /// must rearm the timer for.
    pub fn sched_timer_tick(&self, cpu: CpuId) -> Timestamp {
        let now = self.platform.now();
        let mut ts = self.state(cpu).lock();

        self.keep_time(cpu, now);

        // Outside interrupt context there is no task to account
        if let Some(user) = self.platform.irq_user_mode(cpu) {
            self.account_tick(cpu, &mut ts, user);
        }

        ts.sched_timer.forward(now, self.config.tick_period);
        ts.sched_timer
    }

    /// Low resolution tick: the oneshot device fired
    pub fn lowres_tick(&self, cpu: CpuId) {
        let now = self.platform.now();
        let mut ts = self.state(cpu).lock();

        self.keep_time(cpu, now);

        let user = self.platform.irq_user_mode(cpu).unwrap_or(false);
        self.account_tick(cpu, &mut ts, user);
        self.rearm_periodic(cpu, &mut ts, now);
    }

    // =========================================================================
    // SETUP / TEARDOWN
    // =========================================================================

    /// Start high resolution tick emulation on `cpu`
    pub fn setup_sched_timer(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();
        let mut now = self.platform.now();

        ts.sched_timer = self.jiffies.init_baseline();

        let mut armed = false;
        for _ in 0..MAX_ARM_RETRIES {
            ts.sched_timer.forward(now, self.config.tick_period);
            if self.platform.arm(cpu, ts.sched_timer) && self.platform.is_active(cpu) {
                armed = true;
                break;
            }
            now = self.platform.now();
        }
        warn_on_once!(!armed, "CPU {}: tick emulation not armed", cpu);

        if self.config.enabled {
            ts.nohz_mode = NohzMode::HighRes;
            log::info!("NOHZ: CPU {} switched to high resolution tick emulation", cpu);
        }
    }

    /// Switch `cpu` to low resolution tickless mode
    pub fn switch_to_nohz(&self, cpu: CpuId) {
        if !self.config.enabled {
            return;
        }

        let mut ts = self.state(cpu).lock();
        if !self.platform.switch_to_oneshot(cpu) {
            return;
        }

        ts.nohz_mode = NohzMode::LowRes;

        let period = self.config.tick_period;
        let mut next = self.jiffies.init_baseline();
        for _ in 0..MAX_ARM_RETRIES {
            ts.sched_timer = next;
            if self.platform.arm(cpu, next) {
                break;
            }
            if next.forward(self.platform.now(), period) == 0 {
                next = next.saturating_add(period);
            }
        }

        log::info!("NOHZ: CPU {} switched to low resolution tickless mode", cpu);
    }

    /// Tear down tick emulation of `cpu` (CPU going offline)
    pub fn cancel_sched_timer(&self, cpu: CpuId) {
        let mut ts = self.state(cpu).lock();

        if ts.nohz_mode == NohzMode::HighRes {
            self.platform.cancel(cpu);
        }
        ts.nohz_mode = NohzMode::Inactive;
        self.withdraw_adaptive(cpu);
    }

    // =========================================================================
    // CLOCK NOTIFICATIONS
    // =========================================================================

    /// A clocksource changed: every CPU re-checks its options
    pub fn clock_notify(&self) {
        for state in &self.cpus {
            state.notify_clocks();
        }
    }

    /// The clock event device of `cpu` changed
    pub fn oneshot_notify(&self, cpu: CpuId) {
        self.state(cpu).notify_clocks();
    }

    /// Consume a clock change notification on `cpu`.
    ///
    /// Returns true when high resolution mode became possible and the
    /// caller should switch to it. With `allow_nohz` (high resolution timers
    /// unavailable) the CPU is switched to low resolution tickless mode
    /// instead.
    pub fn check_oneshot_change(&self, cpu: CpuId, allow_nohz: bool) -> bool {
        if !self.state(cpu).take_check_clocks() {
            return false;
        }

        if self.state(cpu).lock().nohz_mode != NohzMode::Inactive {
            return false;
        }

        if !self.platform.valid_for_hres() || !self.platform.oneshot_available(cpu) {
            return false;
        }

        if !allow_nohz {
            return true;
        }

        self.switch_to_nohz(cpu);
        false
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::config::NohzConfig;
    use crate::testing::MockPlatform;
    use crate::tick_sched::NohzMode;
    use crate::time::{Duration, Timestamp};
    use crate::TickController;

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn controller(nr_cpus: usize) -> TickController<MockPlatform> {
        TickController::new(NohzConfig::default(), MockPlatform::new(nr_cpus), nr_cpus).unwrap()
    }

    #[test]
    fn test_setup_arms_next_period() {
        let ctl = controller(1);
        ctl.platform().set_now(ms(3));

        ctl.setup_sched_timer(0);

        assert_eq!(ctl.platform().expiry(0), ms(10));
        assert_eq!(ctl.tick_stats(0).unwrap().nohz_mode, NohzMode::HighRes);
    }

    #[test]
    fn test_sched_tick_claims_vacant_duty() {
        let ctl = controller(2);
        let platform = ctl.platform();
        ctl.setup_sched_timer(1);
        platform.set_user_mode(1, Some(false));

        platform.set_now(ms(10));
        let next = ctl.sched_timer_tick(1);

        assert_eq!(ctl.duty_owner(), Some(1));
        assert_eq!(ctl.jiffies(), 1);
        assert_eq!(next, ms(20));
        assert_eq!(platform.system_process_ticks(1), 1);
        assert_eq!(platform.user_process_ticks(1), 0);
        assert_eq!(platform.do_timer_ticks(), 1);
    }

    #[test]
    fn test_sched_tick_non_owner_leaves_jiffies() {
        let ctl = controller(2);
        let platform = ctl.platform();
        ctl.duty().claim_if_vacant(0);
        platform.set_user_mode(1, Some(true));

        platform.set_now(ms(30));
        ctl.sched_timer_tick(1);

        assert_eq!(ctl.jiffies(), 0);
        assert_eq!(platform.user_process_ticks(1), 1);
        assert_eq!(platform.system_process_ticks(1), 0);
    }

    #[test]
    fn test_sched_tick_outside_irq_skips_accounting() {
        let ctl = controller(1);
        ctl.platform().set_now(ms(20));

        ctl.sched_timer_tick(0);

        assert_eq!(ctl.jiffies(), 2);
        assert_eq!(ctl.platform().process_ticks(0), 0);
    }

    #[test]
    fn test_tick_while_stopped_moves_saved_jiffies() {
        let ctl = controller(2);
        let platform = ctl.platform();
        ctl.setup_sched_timer(0);
        ctl.setup_sched_timer(1);
        ctl.duty().claim_if_vacant(1);
        platform.set_next_timer_in(50);
        platform.set_user_mode(0, Some(false));

        ctl.idle_enter(0);
        assert_eq!(ctl.tick_stats(0).unwrap().saved_jiffies, 0);

        // A late tick on the sleeping CPU is accounted by the handler
        platform.set_now(ms(10));
        ctl.sched_timer_tick(0);
        assert_eq!(ctl.tick_stats(0).unwrap().saved_jiffies, 1);
        assert_eq!(platform.process_ticks(0), 1);

        platform.set_now(ms(40));
        ctl.idle_exit(0);

        // Four ticks elapsed in total, one of them already accounted
        assert_eq!(ctl.jiffies(), 4);
        assert_eq!(platform.idle_ticks(0), 3);
    }

    #[test]
    fn test_switch_to_lowres() {
        let ctl = controller(1);
        let platform = ctl.platform();
        platform.set_now(ms(5));

        ctl.switch_to_nohz(0);

        assert_eq!(ctl.tick_stats(0).unwrap().nohz_mode, NohzMode::LowRes);
        assert_eq!(platform.expiry(0), ms(10));
    }

    #[test]
    fn test_switch_to_lowres_needs_oneshot() {
        let ctl = controller(1);
        ctl.platform().set_oneshot(false);

        ctl.switch_to_nohz(0);
        assert_eq!(ctl.tick_stats(0).unwrap().nohz_mode, NohzMode::Inactive);
    }

    #[test]
    fn test_switch_to_lowres_disabled() {
        let config = NohzConfig::default().with_enabled(false);
        let ctl = TickController::new(config, MockPlatform::new(1), 1).unwrap();

        ctl.switch_to_nohz(0);
        assert_eq!(ctl.tick_stats(0).unwrap().nohz_mode, NohzMode::Inactive);
    }

    #[test]
    fn test_lowres_tick_reprograms() {
        let ctl = controller(1);
        let platform = ctl.platform();
        ctl.switch_to_nohz(0);

        platform.set_now(ms(10));
        platform.fire(0);
        ctl.lowres_tick(0);

        assert_eq!(ctl.jiffies(), 1);
        assert_eq!(platform.expiry(0), ms(20));
        assert_eq!(platform.system_process_ticks(0), 1);
    }

    #[test]
    fn test_lowres_tick_accounts_user_mode() {
        let ctl = controller(1);
        let platform = ctl.platform();
        ctl.switch_to_nohz(0);

        platform.set_user_mode(0, Some(true));
        platform.set_now(ms(10));
        platform.fire(0);
        ctl.lowres_tick(0);

        platform.set_user_mode(0, Some(false));
        platform.set_now(ms(20));
        platform.fire(0);
        ctl.lowres_tick(0);

        assert_eq!(platform.user_process_ticks(0), 1);
        assert_eq!(platform.system_process_ticks(0), 1);
    }

    #[test]
    fn test_lowres_tick_catches_up_on_rejects() {
        let ctl = controller(1);
        let platform = ctl.platform();
        ctl.switch_to_nohz(0);

        platform.set_now(ms(10));
        platform.set_auto_advance(Duration::from_millis(4));
        platform.reject_arms(0, 3);
        ctl.lowres_tick(0);

        let now = platform.peek();
        assert!(platform.expiry(0) > now);
        assert_eq!(ctl.jiffies(), now.as_nanos() / Duration::from_millis(10).as_nanos());
    }

    #[test]
    fn test_cancel_resets_mode() {
        let ctl = controller(1);
        ctl.setup_sched_timer(0);

        ctl.cancel_sched_timer(0);

        assert_eq!(ctl.tick_stats(0).unwrap().nohz_mode, NohzMode::Inactive);
        assert_eq!(ctl.platform().expiry(0), Timestamp::MAX);
    }

    #[test]
    fn test_cancel_withdraws_adaptive() {
        let ctl = controller(1);
        ctl.enlist_adaptive(0);
        assert_eq!(ctl.duty().population().get(), 1);

        ctl.cancel_sched_timer(0);
        assert_eq!(ctl.duty().population().get(), 0);
    }

    #[test]
    fn test_oneshot_change_mailbox() {
        let ctl = controller(2);

        // Nothing posted
        assert!(!ctl.check_oneshot_change(0, false));

        ctl.clock_notify();
        assert!(ctl.check_oneshot_change(0, false));
        assert!(!ctl.check_oneshot_change(0, false));

        // Low resolution switch when high resolution is unavailable
        assert!(!ctl.check_oneshot_change(1, true));
        assert_eq!(ctl.tick_stats(1).unwrap().nohz_mode, NohzMode::LowRes);

        ctl.oneshot_notify(1);
        assert!(!ctl.check_oneshot_change(1, false));
    }

    #[test]
    fn test_oneshot_change_needs_valid_clocksource() {
        let ctl = controller(1);
        ctl.platform().set_valid_for_hres(false);

        ctl.oneshot_notify(0);
        assert!(!ctl.check_oneshot_change(0, false));
    }
}
