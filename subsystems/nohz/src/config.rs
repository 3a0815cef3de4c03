//! # NOHZ Configuration
//!
//! Startup configuration for the tick controller plus the runtime-tunable
//! nohz domain layout.
//!
//! ## Boot Parameters
//!
//! | Parameter   | Effect                                        |
//! |-------------|-----------------------------------------------|
//! | `nohz=on`   | Tickless idle enabled (default)               |
//! | `nohz=off`  | Tick never stopped, idle/iowait queries fail  |
//!
//! ## Nohz Domains
//!
//! CPUs flagged "nohz on" are grouped into domains of `cpus_per_domain`
//! consecutive CPUs. Work targeted at a nohz CPU is redirected to the first
//! CPU of its domain, and nohz CPUs run with the longer `nohz_period`.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::duty::DutyPolicyKind;
use crate::error::{NohzError, NohzResult};
use crate::time::Duration;
use crate::CpuId;

/// Default tick rate
pub const DEFAULT_HZ: u64 = 100;

/// Default number of CPUs per nohz domain
pub const DEFAULT_CPUS_PER_DOMAIN: usize = 4;

/// Nohz CPUs tick this many times slower than regular ones by default
pub const DEFAULT_NOHZ_PERIOD_TICKS: u64 = 100;

/// Lines of "pending softirq" diagnostics printed before going quiet
pub const DEFAULT_SOFTIRQ_REPORT_LIMIT: u32 = 10;

// =============================================================================
// NOHZ CONFIG
// =============================================================================

/// Tick controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NohzConfig {
    /// Tickless mode allowed at all
    pub enabled: bool,
    /// Interval of the periodic tick
    pub tick_period: Duration,
    /// Timer-duty arbitration strategy
    pub policy: DutyPolicyKind,
    /// Cap on rate-limited diagnostics
    pub softirq_report_limit: u32,
    /// Initial CPUs per nohz domain
    pub cpus_per_domain: usize,
    /// Initial tick period of nohz CPUs
    pub nohz_period: Duration,
}

impl NohzConfig {
    /// Configuration for a tick running at `hz`
    pub const fn with_hz(hz: u64) -> Self {
        let tick_period = Duration::from_hz(hz);
        Self {
            enabled: true,
            tick_period,
            policy: DutyPolicyKind::Advisory,
            softirq_report_limit: DEFAULT_SOFTIRQ_REPORT_LIMIT,
            cpus_per_domain: DEFAULT_CPUS_PER_DOMAIN,
            nohz_period: Duration::from_nanos(
                tick_period.as_nanos() * DEFAULT_NOHZ_PERIOD_TICKS,
            ),
        }
    }

    /// Enable or disable tickless mode
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Override the tick period
    pub const fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Select the duty arbitration strategy
    pub const fn with_policy(mut self, policy: DutyPolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Override the diagnostic rate limit
    pub const fn with_softirq_report_limit(mut self, limit: u32) -> Self {
        self.softirq_report_limit = limit;
        self
    }

    /// Override the nohz domain layout
    pub const fn with_domains(mut self, cpus_per_domain: usize, nohz_period: Duration) -> Self {
        self.cpus_per_domain = cpus_per_domain;
        self.nohz_period = nohz_period;
        self
    }

    /// Is adaptive (busy) tickless mode compiled into the policy?
    pub const fn adaptive(&self) -> bool {
        matches!(self.policy, DutyPolicyKind::Adaptive)
    }

    /// Apply a `nohz=` boot parameter (with or without the `nohz=` prefix)
    pub fn parse_boot_param(mut self, param: &str) -> NohzResult<Self> {
        let value = param.trim();
        let value = value.strip_prefix("nohz=").unwrap_or(value);

        self.enabled = match value {
            "on" => true,
            "off" => false,
            _ => return Err(NohzError::InvalidBootParam),
        };
        Ok(self)
    }

    /// Check the values the controller relies on
    pub fn validate(&self) -> NohzResult<()> {
        if self.tick_period.is_zero() {
            return Err(NohzError::InvalidTickPeriod);
        }
        if self.cpus_per_domain == 0 {
            return Err(NohzError::InvalidDomainSize(0));
        }
        Ok(())
    }
}

impl Default for NohzConfig {
    fn default() -> Self {
        Self::with_hz(DEFAULT_HZ)
    }
}

// =============================================================================
// NOHZ DOMAINS
// =============================================================================

/// Runtime nohz domain layout
#[derive(Debug)]
pub struct NohzDomains {
    nohz_on: Vec<AtomicBool>,
    cpus_per_domain: AtomicUsize,
    nohz_period: AtomicU64,
    tick_period: Duration,
}

impl NohzDomains {
    /// Build the layout for `nr_cpus` CPUs, none of them nohz yet
    pub fn new(config: &NohzConfig, nr_cpus: usize) -> Self {
        Self {
            nohz_on: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
            cpus_per_domain: AtomicUsize::new(config.cpus_per_domain),
            nohz_period: AtomicU64::new(config.nohz_period.as_nanos()),
            tick_period: config.tick_period,
        }
    }

    /// Flag a CPU as nohz (or regular)
    pub fn set_nohz_on(&self, cpu: CpuId, on: bool) -> NohzResult<()> {
        let flag = self.nohz_on.get(cpu).ok_or(NohzError::CpuOutOfRange {
            cpu,
            nr_cpus: self.nohz_on.len(),
        })?;
        flag.store(on, Ordering::Relaxed);
        Ok(())
    }

    /// Is `cpu` a nohz CPU? Unknown CPUs are not.
    pub fn cpu_nohz_on(&self, cpu: CpuId) -> bool {
        self.nohz_on
            .get(cpu)
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// CPU that should take work aimed at `cpu`
    pub fn nohz_target(&self, cpu: CpuId) -> CpuId {
        if !self.cpu_nohz_on(cpu) {
            return cpu;
        }
        let per_domain = self.cpus_per_domain();
        (cpu / per_domain) * per_domain
    }

    /// Tick period that applies to `cpu`
    pub fn cpu_tick_period(&self, cpu: CpuId) -> Duration {
        if self.cpu_nohz_on(cpu) {
            self.nohz_period()
        } else {
            self.tick_period
        }
    }

    pub fn cpus_per_domain(&self) -> usize {
        self.cpus_per_domain.load(Ordering::Relaxed)
    }

    /// Resize the domains; non-positive values are rejected
    pub fn set_cpus_per_domain(&self, value: i64) -> NohzResult<()> {
        if value <= 0 {
            return Err(NohzError::InvalidDomainSize(value));
        }
        self.cpus_per_domain.store(value as usize, Ordering::Relaxed);
        Ok(())
    }

    pub fn nohz_period(&self) -> Duration {
        Duration::from_nanos(self.nohz_period.load(Ordering::Relaxed))
    }

    pub fn set_nohz_period(&self, period: Duration) {
        self.nohz_period.store(period.as_nanos(), Ordering::Relaxed);
    }
}

// =============================================================================
// TESTS
// =============================================================================
