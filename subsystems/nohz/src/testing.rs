//! # Mock Platform
//!
//! Deterministic implementation of every collaborator trait, for unit tests
//! here and (with the `testing` feature) in downstream crates.
//!
//! The clock only moves when told to, or by a fixed step on every
//! [`ClockSource::now`] call when auto-advance is set. Tick devices refuse
//! deadlines at or before the current time and can be told to refuse the
//! next few arm attempts outright.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::platform::{
    ClockSource, CpuAccounting, DeferredWork, NeedsCpu, QuiescentHooks, RunningUnit, SchedHooks,
    TickDevice, Timekeeping, TimerWheel,
};
use crate::time::{Duration, Jiffies, Timestamp, NEXT_TIMER_MAX_DELTA};
use crate::CpuId;

#[derive(Debug)]
struct MockDevice {
    expiry: Timestamp,
    reject_remaining: u32,
    arm_count: u64,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            expiry: Timestamp::MAX,
            reject_remaining: 0,
            arm_count: 0,
        }
    }
}

#[derive(Debug, Default)]
struct MockCpu {
    device: Mutex<MockDevice>,
    current: Mutex<RunningUnit>,
    user_mode: Mutex<Option<bool>>,
    online: AtomicBool,
    nr_iowait: AtomicUsize,
    in_adaptive_set: AtomicBool,
    nohz_marker: AtomicBool,
    balancer_idle: AtomicBool,
    sd_idle_calls: AtomicU64,
    idle_ticks: AtomicU64,
    user_ticks: AtomicU64,
    system_ticks: AtomicU64,
    process_ticks: AtomicU64,
    user_process_ticks: AtomicU64,
    softirq_raised: AtomicU64,
    qs_enters: AtomicU64,
    qs_exits: AtomicU64,
}

/// Scriptable platform
#[derive(Debug)]
pub struct MockPlatform {
    cpus: Vec<MockCpu>,
    clock: AtomicU64,
    auto_advance: AtomicU64,
    next_timer_delta: AtomicU64,
    needs_cpu: AtomicU8,
    rcu_pending: AtomicBool,
    softirq_pending: AtomicU32,
    max_deferment: AtomicU64,
    valid_for_hres: AtomicBool,
    oneshot: AtomicBool,
    do_timer_ticks: AtomicU64,
    need_resched: AtomicBool,
    can_stop_tick: AtomicBool,
    posix_timers: AtomicBool,
}

impl MockPlatform {
    /// `nr_cpus` online CPUs running regular tasks, nothing pending, clock
    /// at zero
    pub fn new(nr_cpus: usize) -> Self {
        let cpus = (0..nr_cpus)
            .map(|_| {
                let cpu = MockCpu::default();
                cpu.online.store(true, Ordering::Relaxed);
                cpu
            })
            .collect();

        Self {
            cpus,
            clock: AtomicU64::new(0),
            auto_advance: AtomicU64::new(0),
            next_timer_delta: AtomicU64::new(NEXT_TIMER_MAX_DELTA),
            needs_cpu: AtomicU8::new(0),
            rcu_pending: AtomicBool::new(false),
            softirq_pending: AtomicU32::new(0),
            max_deferment: AtomicU64::new(u64::MAX),
            valid_for_hres: AtomicBool::new(true),
            oneshot: AtomicBool::new(true),
            do_timer_ticks: AtomicU64::new(0),
            need_resched: AtomicBool::new(false),
            can_stop_tick: AtomicBool::new(true),
            posix_timers: AtomicBool::new(false),
        }
    }

    fn cpu(&self, cpu: CpuId) -> &MockCpu {
        &self.cpus[cpu]
    }

    // ---- clock ----

    /// Current time without auto-advancing
    pub fn peek(&self) -> Timestamp {
        Timestamp::from_nanos(self.clock.load(Ordering::SeqCst))
    }

    pub fn set_now(&self, now: Timestamp) {
        self.clock.store(now.as_nanos(), Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        self.clock.fetch_add(delta.as_nanos(), Ordering::SeqCst);
    }

    /// Move the clock by `step` on every `now()` call
    pub fn set_auto_advance(&self, step: Duration) {
        self.auto_advance.store(step.as_nanos(), Ordering::SeqCst);
    }

    // ---- scripting ----

    /// Next timer wheel event `jiffies` ahead of the queried jiffy
    pub fn set_next_timer_in(&self, jiffies: Jiffies) {
        self.next_timer_delta.store(jiffies, Ordering::Relaxed);
    }

    pub fn set_needs_cpu(&self, needs: NeedsCpu) {
        self.needs_cpu.store(needs.bits(), Ordering::Relaxed);
    }

    pub fn set_rcu_pending(&self, pending: bool) {
        self.rcu_pending.store(pending, Ordering::Relaxed);
    }

    pub fn set_softirq_pending(&self, bits: u32) {
        self.softirq_pending.store(bits, Ordering::Relaxed);
    }

    pub fn set_max_deferment(&self, max: Duration) {
        self.max_deferment.store(max.as_nanos(), Ordering::Relaxed);
    }

    pub fn set_valid_for_hres(&self, valid: bool) {
        self.valid_for_hres.store(valid, Ordering::Relaxed);
    }

    pub fn set_oneshot(&self, available: bool) {
        self.oneshot.store(available, Ordering::Relaxed);
    }

    pub fn set_need_resched(&self, resched: bool) {
        self.need_resched.store(resched, Ordering::Relaxed);
    }

    pub fn set_can_stop_tick(&self, can: bool) {
        self.can_stop_tick.store(can, Ordering::Relaxed);
    }

    pub fn set_posix_timers(&self, running: bool) {
        self.posix_timers.store(running, Ordering::Relaxed);
    }

    pub fn set_current(&self, cpu: CpuId, unit: RunningUnit) {
        *self.cpu(cpu).current.lock() = unit;
    }

    pub fn set_user_mode(&self, cpu: CpuId, user: Option<bool>) {
        *self.cpu(cpu).user_mode.lock() = user;
    }

    pub fn set_online(&self, cpu: CpuId, online: bool) {
        self.cpu(cpu).online.store(online, Ordering::Relaxed);
    }

    pub fn set_nr_iowait(&self, cpu: CpuId, tasks: usize) {
        self.cpu(cpu).nr_iowait.store(tasks, Ordering::Relaxed);
    }

    pub fn set_in_adaptive_set(&self, cpu: CpuId, member: bool) {
        self.cpu(cpu).in_adaptive_set.store(member, Ordering::Relaxed);
    }

    /// Refuse the next `count` arm attempts on `cpu`
    pub fn reject_arms(&self, cpu: CpuId, count: u32) {
        self.cpu(cpu).device.lock().reject_remaining = count;
    }

    /// The device of `cpu` fired and is idle again
    pub fn fire(&self, cpu: CpuId) {
        self.cpu(cpu).device.lock().expiry = Timestamp::MAX;
    }

    // ---- observations ----

    pub fn expiry(&self, cpu: CpuId) -> Timestamp {
        self.cpu(cpu).device.lock().expiry
    }

    pub fn arm_count(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).device.lock().arm_count
    }

    pub fn do_timer_ticks(&self) -> u64 {
        self.do_timer_ticks.load(Ordering::SeqCst)
    }

    pub fn idle_ticks(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).idle_ticks.load(Ordering::SeqCst)
    }

    pub fn user_ticks(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).user_ticks.load(Ordering::SeqCst)
    }

    pub fn system_ticks(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).system_ticks.load(Ordering::SeqCst)
    }

    pub fn process_ticks(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).process_ticks.load(Ordering::SeqCst)
    }

    /// Per-tick updates that interrupted user mode
    pub fn user_process_ticks(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).user_process_ticks.load(Ordering::SeqCst)
    }

    /// Per-tick updates that interrupted the kernel
    pub fn system_process_ticks(&self, cpu: CpuId) -> u64 {
        self.process_ticks(cpu) - self.user_process_ticks(cpu)
    }

    pub fn softirq_raised(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).softirq_raised.load(Ordering::SeqCst)
    }

    pub fn balancer_idle(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).balancer_idle.load(Ordering::SeqCst)
    }

    pub fn sd_idle_calls(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).sd_idle_calls.load(Ordering::SeqCst)
    }

    pub fn nohz_marker(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).nohz_marker.load(Ordering::SeqCst)
    }

    pub fn qs_enters(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).qs_enters.load(Ordering::SeqCst)
    }

    pub fn qs_exits(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).qs_exits.load(Ordering::SeqCst)
    }
}

impl ClockSource for MockPlatform {
    fn now(&self) -> Timestamp {
        let step = self.auto_advance.load(Ordering::SeqCst);
        Timestamp::from_nanos(self.clock.fetch_add(step, Ordering::SeqCst) + step)
    }
}

impl TickDevice for MockPlatform {
    fn arm(&self, cpu: CpuId, deadline: Timestamp) -> bool {
        let now = self.peek();
        let mut dev = self.cpu(cpu).device.lock();
        dev.arm_count += 1;

        if dev.reject_remaining > 0 {
            dev.reject_remaining -= 1;
            return false;
        }
        if deadline <= now {
            return false;
        }
        dev.expiry = deadline;
        true
    }

    fn cancel(&self, cpu: CpuId) {
        self.cpu(cpu).device.lock().expiry = Timestamp::MAX;
    }

    fn is_active(&self, cpu: CpuId) -> bool {
        !self.cpu(cpu).device.lock().expiry.is_max()
    }

    fn current_expiry(&self, cpu: CpuId) -> Timestamp {
        self.cpu(cpu).device.lock().expiry
    }

    fn switch_to_oneshot(&self, _cpu: CpuId) -> bool {
        self.oneshot.load(Ordering::Relaxed)
    }

    fn oneshot_available(&self, _cpu: CpuId) -> bool {
        self.oneshot.load(Ordering::Relaxed)
    }
}

impl TimerWheel for MockPlatform {
    fn next_pending_expiry(&self, _cpu: CpuId, from: Jiffies) -> Jiffies {
        from.wrapping_add(self.next_timer_delta.load(Ordering::Relaxed))
    }
}

impl Timekeeping for MockPlatform {
    fn max_deferment(&self) -> Duration {
        Duration::from_nanos(self.max_deferment.load(Ordering::Relaxed))
    }

    fn valid_for_hres(&self) -> bool {
        self.valid_for_hres.load(Ordering::Relaxed)
    }

    fn do_timer(&self, ticks: u64) {
        self.do_timer_ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl DeferredWork for MockPlatform {
    fn needs_cpu(&self, _cpu: CpuId) -> NeedsCpu {
        NeedsCpu::from_bits_truncate(self.needs_cpu.load(Ordering::Relaxed))
    }

    fn rcu_pending(&self, _cpu: CpuId) -> bool {
        self.rcu_pending.load(Ordering::Relaxed)
    }

    fn softirq_pending(&self, _cpu: CpuId) -> u32 {
        self.softirq_pending.load(Ordering::Relaxed)
    }

    fn raise_timer_softirq(&self, cpu: CpuId) {
        self.cpu(cpu).softirq_raised.fetch_add(1, Ordering::SeqCst);
    }
}

impl SchedHooks for MockPlatform {
    fn need_resched(&self, _cpu: CpuId) -> bool {
        self.need_resched.load(Ordering::Relaxed)
    }

    fn can_stop_tick(&self, _cpu: CpuId) -> bool {
        self.can_stop_tick.load(Ordering::Relaxed)
    }

    fn current(&self, cpu: CpuId) -> RunningUnit {
        *self.cpu(cpu).current.lock()
    }

    fn irq_user_mode(&self, cpu: CpuId) -> Option<bool> {
        *self.cpu(cpu).user_mode.lock()
    }

    fn cpu_online(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).online.load(Ordering::Relaxed)
    }

    fn nr_iowait(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).nr_iowait.load(Ordering::Relaxed)
    }

    fn nohz_balancer(&self, cpu: CpuId, idle: bool) {
        self.cpu(cpu).balancer_idle.store(idle, Ordering::SeqCst);
    }

    fn set_sd_state_idle(&self, cpu: CpuId) {
        self.cpu(cpu).sd_idle_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn set_nohz_marker(&self, cpu: CpuId, on: bool) {
        self.cpu(cpu).nohz_marker.store(on, Ordering::SeqCst);
    }

    fn posix_timers_running(&self, _cpu: CpuId) -> bool {
        self.posix_timers.load(Ordering::Relaxed)
    }

    fn in_adaptive_set(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).in_adaptive_set.load(Ordering::Relaxed)
    }
}

impl CpuAccounting for MockPlatform {
    fn account_idle_ticks(&self, cpu: CpuId, ticks: u64) {
        self.cpu(cpu).idle_ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    fn account_user_ticks(&self, cpu: CpuId, ticks: u64) {
        self.cpu(cpu).user_ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    fn account_system_ticks(&self, cpu: CpuId, ticks: u64) {
        self.cpu(cpu).system_ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    fn update_process_times(&self, cpu: CpuId, user: bool) {
        let state = self.cpu(cpu);
        if user {
            state.user_process_ticks.fetch_add(1, Ordering::SeqCst);
        }
        state.process_ticks.fetch_add(1, Ordering::SeqCst);
    }
}

impl QuiescentHooks for MockPlatform {
    fn user_enter(&self, cpu: CpuId, _from_irq: bool) {
        self.cpu(cpu).qs_enters.fetch_add(1, Ordering::SeqCst);
    }

    fn user_exit(&self, cpu: CpuId, _from_irq: bool) {
        self.cpu(cpu).qs_exits.fetch_add(1, Ordering::SeqCst);
    }
}
