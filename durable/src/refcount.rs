//! Inbound-edge bookkeeping.
//!
//! The counter is an injected service: every component that installs or
//! drops an object edge gets it handed in, so tests can swap in a
//! [`VerifyingCounter`]. Counts live in memory only and are keyed by
//! [`ObjectRef`], so they survive contraction and expansion of the target.

use std::fmt;

use ahash::AHashMap;
use log::trace;
use parking_lot::Mutex;

use crate::{InstanceId, ObjectRef, ProtocolViolation, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeReason {
    SlotInstall,
    SlotDrop,
    /// Used for both directions: installing a parent and replacing it.
    ParentInstall,
    CallerInstall,
    CallerDrop,
    ScopeLoad,
    ScopeUnload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Slot,
    Parent,
    Caller,
    Scope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delta {
    Inc,
    Dec,
}

impl EdgeReason {
    pub fn kind(self) -> EdgeKind {
        match self {
            EdgeReason::SlotInstall | EdgeReason::SlotDrop => EdgeKind::Slot,
            EdgeReason::ParentInstall => EdgeKind::Parent,
            EdgeReason::CallerInstall | EdgeReason::CallerDrop => EdgeKind::Caller,
            EdgeReason::ScopeLoad | EdgeReason::ScopeUnload => EdgeKind::Scope,
        }
    }

    /// The direction a reason implies, `None` when it allows both.
    pub fn direction(self) -> Option<Delta> {
        match self {
            EdgeReason::SlotInstall | EdgeReason::CallerInstall | EdgeReason::ScopeLoad => Some(Delta::Inc),
            EdgeReason::SlotDrop | EdgeReason::CallerDrop | EdgeReason::ScopeUnload => Some(Delta::Dec),
            EdgeReason::ParentInstall => None,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            EdgeReason::SlotInstall => EdgeReason::SlotDrop,
            EdgeReason::SlotDrop => EdgeReason::SlotInstall,
            EdgeReason::ParentInstall => EdgeReason::ParentInstall,
            EdgeReason::CallerInstall => EdgeReason::CallerDrop,
            EdgeReason::CallerDrop => EdgeReason::CallerInstall,
            EdgeReason::ScopeLoad => EdgeReason::ScopeUnload,
            EdgeReason::ScopeUnload => EdgeReason::ScopeLoad,
        }
    }
}

impl Delta {
    pub fn inverse(self) -> Self {
        match self {
            Delta::Inc => Delta::Dec,
            Delta::Dec => Delta::Inc,
        }
    }
}

/// The instance (and slot, for slot edges) an edge starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Holder {
    pub instance: InstanceId,
    pub slot: Option<usize>,
}

impl Holder {
    pub fn of(instance: InstanceId) -> Self {
        Self { instance, slot: None }
    }

    pub fn slot(instance: InstanceId, index: usize) -> Self {
        Self {
            instance,
            slot: Some(index),
        }
    }
}

pub trait ReferenceCounter: Send + Sync {
    /// Applies one edge change and returns the new count. An underflow is
    /// reported and leaves the count untouched.
    fn adjust(&self, target: &ObjectRef, reason: EdgeReason, holder: Holder, delta: Delta) -> Result<usize>;

    fn count(&self, target: &ObjectRef) -> usize;
}

impl fmt::Debug for dyn ReferenceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReferenceCounter")
    }
}

/// The production counter.
#[derive(Debug, Default)]
pub struct RefCounter {
    counts: Mutex<AHashMap<ObjectRef, usize>>,
}

impl RefCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReferenceCounter for RefCounter {
    fn adjust(&self, target: &ObjectRef, reason: EdgeReason, holder: Holder, delta: Delta) -> Result<usize> {
        let mut counts = self.counts.lock();
        let current = counts.get(target).copied().unwrap_or(0);
        let next = match delta {
            Delta::Inc => current + 1,
            Delta::Dec => current
                .checked_sub(1)
                .ok_or_else(|| ProtocolViolation::RefCountUnderflow { target: target.clone() })?,
        };
        if next == 0 {
            counts.remove(target);
        } else {
            counts.insert(target.clone(), next);
        }
        trace!("{target} {reason:?} {delta:?} from {holder:?} -> {next}");
        Ok(next)
    }

    fn count(&self, target: &ObjectRef) -> usize {
        self.counts.lock().get(target).copied().unwrap_or(0)
    }
}

// ── Verifying counter ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct Ledger {
    /// Live edges, each key may exist at most once.
    edges: AHashMap<(ObjectRef, Holder, EdgeKind), usize>,
    violations: Vec<String>,
}

/// A counter that also tracks every individual edge, for tests.
///
/// Records a violation whenever the same edge is counted twice, an edge is
/// dropped that was never installed, or a reason is used in the wrong
/// direction.
#[derive(Debug, Default)]
pub struct VerifyingCounter {
    inner: RefCounter,
    ledger: Mutex<Ledger>,
}

impl VerifyingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn violations(&self) -> Vec<String> {
        self.ledger.lock().violations.clone()
    }

    /// Live edges pointing at `target`.
    pub fn edges_into(&self, target: &ObjectRef) -> usize {
        self.ledger
            .lock()
            .edges
            .iter()
            .filter(|((t, _, _), _)| t == target)
            .map(|(_, n)| *n)
            .sum()
    }

    #[cfg(test)]
    pub fn edges_from(&self, holder: InstanceId) -> usize {
        self.ledger
            .lock()
            .edges
            .iter()
            .filter(|((_, h, _), _)| h.instance == holder)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Targets whose count differs from their live edges.
    pub fn imbalances(&self) -> Vec<(ObjectRef, usize, usize)> {
        let ledger = self.ledger.lock();
        let mut per_target: AHashMap<&ObjectRef, usize> = AHashMap::new();
        for ((target, _, _), n) in &ledger.edges {
            *per_target.entry(target).or_default() += n;
        }
        let mut out: Vec<_> = per_target
            .into_iter()
            .filter_map(|(target, edges)| {
                let count = self.inner.count(target);
                (count != edges).then(|| (target.clone(), count, edges))
            })
            .collect();
        out.sort();
        out
    }
}

impl ReferenceCounter for VerifyingCounter {
    fn adjust(&self, target: &ObjectRef, reason: EdgeReason, holder: Holder, delta: Delta) -> Result<usize> {
        let mut ledger = self.ledger.lock();
        if reason.direction().is_some_and(|d| d != delta) {
            ledger
                .violations
                .push(format!("{reason:?} used as {delta:?} on {target} from {holder:?}"));
        }
        let key = (target.clone(), holder, reason.kind());
        match delta {
            Delta::Inc => {
                let n = ledger.edges.entry(key).or_default();
                *n += 1;
                if *n > 1 {
                    ledger
                        .violations
                        .push(format!("{target} counted twice for {holder:?} ({reason:?})"));
                }
            }
            Delta::Dec => match ledger.edges.get_mut(&key) {
                Some(n) if *n > 1 => *n -= 1,
                Some(_) => {
                    ledger.edges.remove(&key);
                }
                None => ledger
                    .violations
                    .push(format!("{target} dropped from {holder:?} ({reason:?}) without an edge")),
            },
        }
        drop(ledger);
        self.inner.adjust(target, reason, holder, delta)
    }

    fn count(&self, target: &ObjectRef) -> usize {
        self.inner.count(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DurableError, ProtocolViolation};

    fn holder(id: u64) -> Holder {
        Holder::slot(InstanceId(id), 0)
    }

    #[test]
    fn counts_follow_adjustments() {
        let counter = RefCounter::new();
        let a = ObjectRef::new("A", 1);
        assert_eq!(counter.adjust(&a, EdgeReason::SlotInstall, holder(1), Delta::Inc).expect("inc"), 1);
        assert_eq!(counter.adjust(&a, EdgeReason::CallerInstall, Holder::of(InstanceId(2)), Delta::Inc).expect("inc"), 2);
        assert_eq!(counter.adjust(&a, EdgeReason::SlotDrop, holder(1), Delta::Dec).expect("dec"), 1);
        assert_eq!(counter.count(&a), 1);
    }

    #[test]
    fn underflow_is_a_protocol_violation_and_changes_nothing() {
        let counter = RefCounter::new();
        let a = ObjectRef::new("A", 1);
        let err = counter
            .adjust(&a, EdgeReason::SlotDrop, holder(1), Delta::Dec)
            .unwrap_err();
        assert!(matches!(
            err,
            DurableError::Protocol(ProtocolViolation::RefCountUnderflow { .. })
        ));
        assert_eq!(counter.count(&a), 0);
    }

    #[test]
    fn verifying_counter_flags_double_counting() {
        let counter = VerifyingCounter::new();
        let a = ObjectRef::new("A", 1);
        counter.adjust(&a, EdgeReason::SlotInstall, holder(1), Delta::Inc).expect("first");
        counter.adjust(&a, EdgeReason::SlotInstall, holder(1), Delta::Inc).expect("second");
        assert_eq!(counter.violations().len(), 1);
        assert_eq!(counter.edges_into(&a), 2);
        assert!(counter.imbalances().is_empty(), "count and edges still agree");
    }

    #[test]
    fn verifying_counter_flags_wrong_direction() {
        let counter = VerifyingCounter::new();
        let a = ObjectRef::new("A", 1);
        counter.adjust(&a, EdgeReason::ScopeUnload, holder(1), Delta::Inc).expect("inc");
        assert_eq!(counter.violations().len(), 1);
    }

    #[test]
    fn reasons_invert() {
        for reason in [
            EdgeReason::SlotInstall,
            EdgeReason::ParentInstall,
            EdgeReason::CallerDrop,
            EdgeReason::ScopeLoad,
        ] {
            assert_eq!(reason.inverse().inverse(), reason);
            assert_eq!(reason.inverse().kind(), reason.kind());
        }
    }
}
