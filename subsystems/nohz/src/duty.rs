//! # Timer-Duty Arbiter
//!
//! Exactly one CPU at a time is responsible for advancing jiffies while the
//! others may stop their tick. The owner slot is a single atomic; it is only
//! ever changed by an exchange, never under a lock.
//!
//! ```text
//!                ┌──────────────────────────────────────────────┐
//!                │          adaptive population == 0 ?          │
//!                └───────────────┬───────────────────┬──────────┘
//!                           yes  │                   │  no
//!                                ▼                   ▼
//!                   release: owner ← NONE     owner == self ──▶ keep it
//!                   if we held it             owner == NONE
//!                                             or owner busy-tickless and
//!                                             (we are idle or not adaptive)
//!                                               ──▶ take it
//!                                             otherwise ──▶ leave it
//! ```
//!
//! Two strategies share the same exchange-based interface and are chosen
//! at startup:
//!
//! - [`AdvisoryPolicy`]: no busy-tickless CPUs can exist. The slot is
//!   overwritten unconditionally; the last store wins and nobody retries.
//! - [`AdaptivePolicy`]: busy-tickless CPUs may exist, so duty must never
//!   be dropped on the floor. Compare-and-exchange with bounded retries.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crate::warn_on_once;
use crate::CpuId;

/// Raw slot value meaning "no owner"
const NO_OWNER: usize = usize::MAX;

static_assertions::const_assert!(crate::MAX_CPUS <= NO_OWNER);

/// Passes through the election loop that are expected under normal load
pub const EXPECTED_DUTY_PASSES: u32 = 2;

/// Hard cap on election passes before falling through
pub const MAX_DUTY_PASSES: u32 = 16;

#[inline]
const fn encode(owner: Option<CpuId>) -> usize {
    match owner {
        Some(cpu) => cpu,
        None => NO_OWNER,
    }
}

#[inline]
const fn decode(raw: usize) -> Option<CpuId> {
    if raw == NO_OWNER {
        None
    } else {
        Some(raw)
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Result of an election attempt, seen from the calling CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyOutcome {
    /// The caller owns the duty (took it or kept it)
    Acquired,
    /// Nobody owns the duty now
    Dropped,
    /// Another CPU owns the duty
    Retained(CpuId),
}

impl DutyOutcome {
    fn from_owner(owner: Option<CpuId>, cpu: CpuId) -> Self {
        match owner {
            Some(owner) if owner == cpu => DutyOutcome::Acquired,
            Some(owner) => DutyOutcome::Retained(owner),
            None => DutyOutcome::Dropped,
        }
    }

    /// Resulting owner
    pub fn owner(self, cpu: CpuId) -> Option<CpuId> {
        match self {
            DutyOutcome::Acquired => Some(cpu),
            DutyOutcome::Dropped => None,
            DutyOutcome::Retained(owner) => Some(owner),
        }
    }
}

// =============================================================================
// POLICY
// =============================================================================

/// What the arbiter needs to know about the rest of the system
pub trait DutyView {
    /// Is `cpu` currently counted as busy-tickless?
    fn is_adaptive(&self, cpu: CpuId) -> bool;

    /// May the caller pull the duty away from a busy-tickless owner?
    /// (It is idle, or not part of the adaptive set.)
    fn may_take_from_adaptive(&self) -> bool;
}

/// One pass of the election, as decided by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    /// Nothing to exchange; the caller already owns the duty
    Keep,
    /// Exchange `expected` for `desired`
    Exchange {
        expected: Option<CpuId>,
        desired: Option<CpuId>,
        /// Restart if busy-tickless CPUs show up after the exchange
        recheck_population: bool,
    },
}

/// Arbitration strategy
pub trait ArbitrationPolicy: Send + Sync + fmt::Debug {
    /// Decide what to exchange for `cpu` given the observed state
    fn propose(
        &self,
        cpu: CpuId,
        observed: Option<CpuId>,
        population: isize,
        view: &dyn DutyView,
    ) -> Proposal;

    /// Perform the exchange, returning the previous owner
    fn exchange(
        &self,
        slot: &AtomicUsize,
        expected: Option<CpuId>,
        desired: Option<CpuId>,
    ) -> Option<CpuId>;
}

/// Strategy selector used by the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DutyPolicyKind {
    /// No busy-tickless CPUs; ownership is advisory
    #[default]
    Advisory,
    /// Busy-tickless CPUs supported
    Adaptive,
}

impl DutyPolicyKind {
    /// Instantiate the strategy
    pub fn build(self) -> Box<dyn ArbitrationPolicy> {
        match self {
            DutyPolicyKind::Advisory => Box::new(AdvisoryPolicy),
            DutyPolicyKind::Adaptive => Box::new(AdaptivePolicy),
        }
    }
}

/// Unconditional overwrite, never retried
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvisoryPolicy;

impl ArbitrationPolicy for AdvisoryPolicy {
    fn propose(
        &self,
        cpu: CpuId,
        _observed: Option<CpuId>,
        _population: isize,
        _view: &dyn DutyView,
    ) -> Proposal {
        Proposal::Exchange {
            expected: Some(cpu),
            desired: None,
            recheck_population: false,
        }
    }

    fn exchange(
        &self,
        slot: &AtomicUsize,
        _expected: Option<CpuId>,
        desired: Option<CpuId>,
    ) -> Option<CpuId> {
        decode(slot.swap(encode(desired), Ordering::AcqRel))
    }
}

/// Compare-and-exchange election aware of busy-tickless CPUs
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptivePolicy;

impl ArbitrationPolicy for AdaptivePolicy {
    fn propose(
        &self,
        cpu: CpuId,
        observed: Option<CpuId>,
        population: isize,
        view: &dyn DutyView,
    ) -> Proposal {
        if population <= 0 {
            // Release only what we hold, then make sure nobody went
            // busy-tickless in the meantime.
            return Proposal::Exchange {
                expected: Some(cpu),
                desired: None,
                recheck_population: true,
            };
        }

        match observed {
            // Keep the duty until someone takes it away
            Some(owner) if owner == cpu => Proposal::Keep,
            None => Proposal::Exchange {
                expected: None,
                desired: Some(cpu),
                recheck_population: false,
            },
            Some(owner) if view.is_adaptive(owner) && view.may_take_from_adaptive() => {
                Proposal::Exchange {
                    expected: Some(owner),
                    desired: Some(cpu),
                    recheck_population: false,
                }
            },
            // A regular CPU is updating jiffies; leave it alone
            Some(owner) => Proposal::Exchange {
                expected: Some(owner),
                desired: Some(owner),
                recheck_population: false,
            },
        }
    }

    fn exchange(
        &self,
        slot: &AtomicUsize,
        expected: Option<CpuId>,
        desired: Option<CpuId>,
    ) -> Option<CpuId> {
        match slot.compare_exchange(
            encode(expected),
            encode(desired),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) | Err(prev) => decode(prev),
        }
    }
}

// =============================================================================
// ADAPTIVE POPULATION
// =============================================================================

/// Number of CPUs currently running busy-tickless
#[derive(Debug, Default)]
pub struct AdaptivePopulation {
    count: AtomicIsize,
}

impl AdaptivePopulation {
    pub const fn new() -> Self {
        Self {
            count: AtomicIsize::new(0),
        }
    }

    pub fn get(&self) -> isize {
        self.count.load(Ordering::Acquire)
    }

    pub fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        warn_on_once!(prev <= 0, "adaptive population went negative ({})", prev - 1);
    }
}

// =============================================================================
// ARBITER
// =============================================================================

/// Owner of the global timer duty
pub struct DutyArbiter {
    owner: AtomicUsize,
    population: AdaptivePopulation,
    policy: Box<dyn ArbitrationPolicy>,
}

impl DutyArbiter {
    /// Create an arbiter with no owner
    pub fn new(kind: DutyPolicyKind) -> Self {
        Self::with_policy(kind.build())
    }

    /// Create an arbiter with a custom strategy
    pub fn with_policy(policy: Box<dyn ArbitrationPolicy>) -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            population: AdaptivePopulation::new(),
            policy,
        }
    }

    /// Current owner
    pub fn owner(&self) -> Option<CpuId> {
        decode(self.owner.load(Ordering::Acquire))
    }

    /// Busy-tickless population counter
    pub fn population(&self) -> &AdaptivePopulation {
        &self.population
    }

    /// Take a vacant duty. Racing claimers are harmless: jiffies updates
    /// are serialized by the sequence lock anyway.
    pub fn claim_if_vacant(&self, cpu: CpuId) -> bool {
        if self.owner().is_none() {
            self.owner.store(encode(Some(cpu)), Ordering::Release);
            return true;
        }
        false
    }

    /// Best-effort release by a CPU noticing `cpu` went offline holding
    /// the duty. Not safe against concurrent claims, which cannot come
    /// from an offline CPU.
    pub fn clear_if_owner(&self, cpu: CpuId) {
        if self.owner() == Some(cpu) {
            self.owner.store(NO_OWNER, Ordering::Release);
        }
    }

    /// Drop the duty if the policy lets `cpu` go tickless, or take it over
    /// when busy-tickless CPUs would otherwise be left without a timekeeper.
    pub fn try_drop_or_reassign(&self, cpu: CpuId, view: &dyn DutyView) -> DutyOutcome {
        let mut pass = 0;

        loop {
            pass += 1;
            if pass > MAX_DUTY_PASSES {
                warn_on_once!(true, "duty election gave up after {} passes", MAX_DUTY_PASSES);
                return DutyOutcome::from_owner(self.owner(), cpu);
            }
            warn_on_once!(
                pass > EXPECTED_DUTY_PASSES,
                "duty election contended on CPU {} ({} passes)",
                cpu,
                pass
            );

            let population = self.population.get();
            let observed = self.owner();

            let (expected, desired, recheck) =
                match self.policy.propose(cpu, observed, population, view) {
                    Proposal::Keep => return DutyOutcome::Acquired,
                    Proposal::Exchange {
                        expected,
                        desired,
                        recheck_population,
                    } => (expected, desired, recheck_population),
                };

            let prev = self.policy.exchange(&self.owner, expected, desired);

            if recheck && self.population.get() > 0 {
                continue;
            }

            match desired {
                Some(new_owner) => {
                    if prev == expected {
                        return DutyOutcome::from_owner(Some(new_owner), cpu);
                    }
                    // Changed under us; whoever has it might just drop it
                },
                None => {
                    // We either just dropped the duty or never had it
                    let owner = if prev == Some(cpu) { None } else { prev };
                    return DutyOutcome::from_owner(owner, cpu);
                },
            }
        }
    }
}

impl fmt::Debug for DutyArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyArbiter")
            .field("owner", &self.owner())
            .field("population", &self.population.get())
            .field("policy", &self.policy)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    /// Fixed answers for the arbiter's questions
    struct View {
        adaptive: Vec<CpuId>,
        may_take: bool,
    }

    impl DutyView for View {
        fn is_adaptive(&self, cpu: CpuId) -> bool {
            self.adaptive.contains(&cpu)
        }

        fn may_take_from_adaptive(&self) -> bool {
            self.may_take
        }
    }

    fn view() -> View {
        View {
            adaptive: Vec::new(),
            may_take: true,
        }
    }

    #[test]
    fn test_advisory_owner_drops() {
        let arbiter = DutyArbiter::new(DutyPolicyKind::Advisory);
        arbiter.claim_if_vacant(0);

        assert_eq!(arbiter.try_drop_or_reassign(0, &view()), DutyOutcome::Dropped);
        assert_eq!(arbiter.owner(), None);
    }

    #[test]
    fn test_advisory_overwrites_unconditionally() {
        let arbiter = DutyArbiter::new(DutyPolicyKind::Advisory);
        arbiter.claim_if_vacant(2);

        // Last store wins; the caller learns who held it
        assert_eq!(arbiter.try_drop_or_reassign(1, &view()), DutyOutcome::Retained(2));
        assert_eq!(arbiter.owner(), None);
    }

    #[test]
    fn test_adaptive_no_population_releases_own_duty_only() {
        let arbiter = DutyArbiter::new(DutyPolicyKind::Adaptive);
        arbiter.claim_if_vacant(2);

        assert_eq!(arbiter.try_drop_or_reassign(1, &view()), DutyOutcome::Retained(2));
        assert_eq!(arbiter.owner(), Some(2));

        assert_eq!(arbiter.try_drop_or_reassign(2, &view()), DutyOutcome::Dropped);
        assert_eq!(arbiter.owner(), None);
    }

    #[test]
    fn test_adaptive_takes_vacant_duty() {
        let arbiter = DutyArbiter::new(DutyPolicyKind::Adaptive);
        arbiter.population().enter();

        assert_eq!(arbiter.try_drop_or_reassign(3, &view()), DutyOutcome::Acquired);
        assert_eq!(arbiter.owner(), Some(3));

        // Sticks with it
        assert_eq!(arbiter.try_drop_or_reassign(3, &view()), DutyOutcome::Acquired);
    }

    #[test]
    fn test_adaptive_takes_from_busy_tickless_owner() {
        let arbiter = DutyArbiter::new(DutyPolicyKind::Adaptive);
        arbiter.population().enter();
        arbiter.claim_if_vacant(1);

        let view = View {
            adaptive: std::vec![1],
            may_take: true,
        };
        assert_eq!(arbiter.try_drop_or_reassign(0, &view), DutyOutcome::Acquired);
        assert_eq!(arbiter.owner(), Some(0));
    }

    #[test]
    fn test_adaptive_leaves_regular_owner() {
        let arbiter = DutyArbiter::new(DutyPolicyKind::Adaptive);
        arbiter.population().enter();
        arbiter.claim_if_vacant(1);

        assert_eq!(arbiter.try_drop_or_reassign(0, &view()), DutyOutcome::Retained(1));

        let busy = View {
            adaptive: std::vec![1],
            may_take: false,
        };
        assert_eq!(arbiter.try_drop_or_reassign(0, &busy), DutyOutcome::Retained(1));
        assert_eq!(arbiter.owner(), Some(1));
    }

    #[test]
    fn test_outcome_owner() {
        assert_eq!(DutyOutcome::Acquired.owner(4), Some(4));
        assert_eq!(DutyOutcome::Dropped.owner(4), None);
        assert_eq!(DutyOutcome::Retained(1).owner(4), Some(1));
    }

    #[test]
    fn test_concurrent_advisory_no_failure() {
        let arbiter = Arc::new(DutyArbiter::new(DutyPolicyKind::Advisory));
        arbiter.claim_if_vacant(0);

        let handles: Vec<_> = (0..2)
            .map(|cpu| {
                let arbiter = Arc::clone(&arbiter);
                thread::spawn(move || arbiter.try_drop_or_reassign(cpu, &view()))
            })
            .collect();

        for handle in handles {
            let outcome = handle.join().unwrap();
            assert_ne!(outcome, DutyOutcome::Acquired);
        }
        assert_eq!(arbiter.owner(), None);
    }

    #[test]
    fn test_concurrent_adaptive_single_owner() {
        let arbiter = Arc::new(DutyArbiter::new(DutyPolicyKind::Adaptive));
        arbiter.population().enter();

        let handles: Vec<_> = (0..8)
            .map(|cpu| {
                let arbiter = Arc::clone(&arbiter);
                thread::spawn(move || {
                    let view = View {
                        adaptive: Vec::new(),
                        may_take: false,
                    };
                    (cpu, arbiter.try_drop_or_reassign(cpu, &view))
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let owner = arbiter.owner().unwrap();

        let winners = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == DutyOutcome::Acquired)
            .count();
        assert_eq!(winners, 1);

        for (cpu, outcome) in outcomes {
            assert_eq!(outcome.owner(cpu), Some(owner));
        }
    }

    #[test]
    fn test_population_counts() {
        let population = AdaptivePopulation::new();
        population.enter();
        population.enter();
        population.leave();
        assert_eq!(population.get(), 1);
    }

    /// Always wants the duty and always loses the exchange to CPU 7
    #[cfg(not(feature = "debug"))]
    #[derive(Debug)]
    struct LosingPolicy {
        exchanges: Arc<core::sync::atomic::AtomicU32>,
    }

    #[cfg(not(feature = "debug"))]
    impl ArbitrationPolicy for LosingPolicy {
        fn propose(
            &self,
            cpu: CpuId,
            _observed: Option<CpuId>,
            _population: isize,
            _view: &dyn DutyView,
        ) -> Proposal {
            Proposal::Exchange {
                expected: None,
                desired: Some(cpu),
                recheck_population: false,
            }
        }

        fn exchange(
            &self,
            slot: &AtomicUsize,
            _expected: Option<CpuId>,
            _desired: Option<CpuId>,
        ) -> Option<CpuId> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            slot.store(7, Ordering::SeqCst);
            Some(7)
        }
    }

    #[cfg(not(feature = "debug"))]
    #[test]
    fn test_contended_election_is_bounded() {
        let exchanges = Arc::new(core::sync::atomic::AtomicU32::new(0));
        let arbiter = DutyArbiter::with_policy(Box::new(LosingPolicy {
            exchanges: Arc::clone(&exchanges),
        }));

        let outcome = arbiter.try_drop_or_reassign(0, &view());

        // Falls through to whoever holds the slot now
        assert_eq!(outcome, DutyOutcome::Retained(7));
        assert_eq!(outcome, DutyOutcome::from_owner(arbiter.owner(), 0));
        assert_eq!(exchanges.load(Ordering::SeqCst), MAX_DUTY_PASSES);
    }
}
