//! # Error Types
//!
//! The tick control path itself has no recoverable errors: races are
//! retried and policy violations decline silently. Errors only surface at
//! the configuration and construction boundary.

use core::fmt;

use crate::CpuId;

/// NOHZ configuration / construction errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NohzError {
    /// `nohz=` boot parameter other than `on` / `off`
    InvalidBootParam,
    /// Tick period of zero
    InvalidTickPeriod,
    /// CPU count of zero or above the supported maximum
    InvalidCpuCount {
        requested: usize,
        max: usize,
    },
    /// CPUs-per-domain value that is not strictly positive
    InvalidDomainSize(i64),
    /// CPU index beyond the configured CPU count
    CpuOutOfRange {
        cpu: CpuId,
        nr_cpus: usize,
    },
}

impl NohzError {
    /// Short stable name, handy for log prefixes
    pub const fn name(&self) -> &'static str {
        match self {
            NohzError::InvalidBootParam => "InvalidBootParam",
            NohzError::InvalidTickPeriod => "InvalidTickPeriod",
            NohzError::InvalidCpuCount { .. } => "InvalidCpuCount",
            NohzError::InvalidDomainSize(_) => "InvalidDomainSize",
            NohzError::CpuOutOfRange { .. } => "CpuOutOfRange",
        }
    }
}

impl fmt::Display for NohzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NohzError::InvalidBootParam => write!(f, "nohz= expects \"on\" or \"off\""),
            NohzError::InvalidTickPeriod => write!(f, "Tick period must be non-zero"),
            NohzError::InvalidCpuCount { requested, max } => {
                write!(f, "Invalid CPU count {} (supported: 1..={})", requested, max)
            },
            NohzError::InvalidDomainSize(value) => {
                write!(f, "CPUs per nohz domain must be positive, got {}", value)
            },
            NohzError::CpuOutOfRange { cpu, nr_cpus } => {
                write!(f, "CPU {} out of range ({} CPUs)", cpu, nr_cpus)
            },
        }
    }
}

/// Result type for NOHZ configuration
pub type NohzResult<T> = Result<T, NohzError>;

// =============================================================================
// TESTS
// =============================================================================
