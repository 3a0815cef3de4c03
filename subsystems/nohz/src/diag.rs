//! # Diagnostics
//!
//! Invariant reporting and log rate limiting for interrupt-context code.
//!
//! Nothing here ever aborts the control path in a production build: an
//! invariant violation is logged once per call site and execution goes on.
//! Building with the `debug` feature turns the report into a panic.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Report a violated invariant once per call site.
///
/// Evaluates to the condition, so it can guard a defensive early return:
///
/// ```rust,ignore
/// if warn_on_once!(ts.whence != JiffiesWhence::User, "bad bucket {:?}", ts.whence) {
///     return;
/// }
/// ```
#[macro_export]
macro_rules! warn_on_once {
    ($cond:expr, $($arg:tt)+) => {{
        let violated: bool = $cond;
        if violated {
            static REPORTED: core::sync::atomic::AtomicBool =
                core::sync::atomic::AtomicBool::new(false);
            if !REPORTED.swap(true, core::sync::atomic::Ordering::Relaxed) {
                $crate::diag::report_invariant(core::format_args!($($arg)+));
            }
        }
        violated
    }};
}

/// Sink for [`warn_on_once!`]
#[cold]
pub fn report_invariant(args: fmt::Arguments<'_>) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "debug")] {
            panic!("NOHZ: invariant violated: {}", args);
        } else {
            log::warn!("NOHZ: invariant violated: {}", args);
        }
    }
}

// =============================================================================
// RATE LIMIT
// =============================================================================

/// Caps the number of times a noisy diagnostic is emitted
#[derive(Debug)]
pub struct RateLimit {
    emitted: AtomicU32,
    limit: u32,
}

impl RateLimit {
    /// Allow at most `limit` emissions
    pub const fn new(limit: u32) -> Self {
        Self {
            emitted: AtomicU32::new(0),
            limit,
        }
    }

    /// Claim one emission slot; false once the limit is reached
    pub fn allow(&self) -> bool {
        self.emitted
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Emissions so far
    pub fn emitted(&self) -> u32 {
        self.emitted.load(Ordering::Relaxed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
