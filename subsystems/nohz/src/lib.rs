//! # Helix NOHZ Subsystem
//!
//! Tickless scheduling-clock controller. Decides, per CPU, when the periodic
//! tick may be stopped (idle, or busy running a single task), when it must
//! fire next, and which CPU keeps advancing global time meanwhile.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          TickController                              │
//! │                                                                      │
//! │  ┌───────────────────────┐   ┌───────────────────────────────────┐   │
//! │  │  Idle tick state      │   │  Adaptive (busy tickless)         │   │
//! │  │  machine              │◀──│  controller                       │   │
//! │  │  idle_enter/idle_exit │   │  irq_exit, kernel entry/exit,     │   │
//! │  │  check_idle/irq_exit  │   │  pre/post_schedule                │   │
//! │  └──────────┬────────────┘   └───────────────────────────────────┘   │
//! │             │                                                        │
//! │   ┌─────────┴─────────┬──────────────────┬───────────────────────┐   │
//! │   ▼                   ▼                  ▼                       ▼   │
//! │ ┌─────────────┐ ┌─────────────┐ ┌────────────────┐ ┌──────────────┐  │
//! │ │ DutyArbiter │ │JiffiesClock │ │ CpuTickState[] │ │ NohzDomains  │  │
//! │ │ (atomic CAS)│ │ (seqlock)   │ │ idle accounting│ │              │  │
//! │ └─────────────┘ └─────────────┘ └────────────────┘ └──────────────┘  │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                 │ Platform
//!                                 ▼
//!      clock · tick device · timer wheel · timekeeping · scheduler · RCU
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let config = NohzConfig::default().parse_boot_param("nohz=on")?;
//! let ctl = TickController::new(config, platform, nr_cpus)?;
//!
//! // per CPU, at bring-up
//! ctl.setup_sched_timer(cpu);
//!
//! // idle loop
//! ctl.idle_enter(cpu);
//! // ... wait for interrupt ...
//! ctl.idle_exit(cpu);
//! ```
//!
//! ## Features
//!
//! - `debug`: invariant violations panic instead of being logged once
//! - `testing`: export [`testing::MockPlatform`]

#![no_std]

extern crate alloc;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Invariant reporting and rate limiting
pub mod diag;

/// Configuration and nohz domains
pub mod config;

/// Tick controller entry points
pub mod controller;

/// Timer duty arbitration
pub mod duty;

pub mod error;

/// Global jiffies clock
pub mod jiffies;

/// Collaborator traits
pub mod platform;

pub mod seqlock;

/// Per-CPU tick record and idle accounting
pub mod tick_sched;

pub mod time;

/// Mock platform for tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use config::{NohzConfig, NohzDomains};
pub use controller::TickController;
pub use duty::{DutyArbiter, DutyOutcome, DutyPolicyKind};
pub use error::{NohzError, NohzResult};
pub use jiffies::JiffiesClock;
pub use platform::{NeedsCpu, Platform, RunningUnit};
pub use tick_sched::{JiffiesWhence, NohzMode, TickStats};
pub use time::{Duration, Jiffies, Timestamp};

// =============================================================================
// CONSTANTS
// =============================================================================

/// CPU index
pub type CpuId = usize;

/// Maximum number of CPUs
pub const MAX_CPUS: usize = 256;

static_assertions::const_assert!(time::NEXT_TIMER_MAX_DELTA > 1);
static_assertions::assert_impl_all!(DutyArbiter: Send, Sync);
static_assertions::assert_impl_all!(JiffiesClock: Send, Sync);
static_assertions::assert_impl_all!(tick_sched::CpuTickState: Send, Sync);
