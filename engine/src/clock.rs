//! Vector clocks for causal ordering of writes.
//!
//! Every replica owns one counter. A write is stamped with the writer's full
//! clock after incrementing its own counter, so comparing two stamps tells
//! whether one write had seen the other (`Before`/`After`), whether they are
//! the same write (`Equal`), or whether they raced (`Concurrent`).
//!
//! All operations are pure: they take clocks by reference and return new
//! values. Replicas thread their clock through explicitly instead of sharing
//! a process-wide counter.

use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalOrder {
    /// Left happened before right (right dominates).
    Before,
    /// Left happened after right (left dominates).
    After,
    /// Neither dominates; the writes raced.
    Concurrent,
    /// Identical clocks.
    Equal,
}

/// A map of per-replica counters.
///
/// Zero counters are never stored, so a replica that has not contributed is
/// simply absent. This keeps equal clocks byte-identical when serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// An empty clock (all counters zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a replica, zero if it never contributed.
    pub fn get(&self, replica: &str) -> u64 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    /// True when no replica has contributed yet.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate `(replica, counter)` pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.counters.iter().map(|(r, c)| (r, *c))
    }

    /// Sum of all counters. Useful as a rough size of the causal history.
    pub fn total(&self) -> u64 {
        self.counters.values().sum()
    }

    /// Return a copy with `replica`'s counter incremented by one.
    ///
    /// Only the owning replica may tick its own counter.
    pub fn tick(&self, replica: &str) -> VectorClock {
        let mut next = self.clone();
        *next.counters.entry(replica.to_string()).or_insert(0) += 1;
        next
    }

    /// Pointwise maximum of two clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (replica, &counter) in &other.counters {
            let slot = merged.counters.entry(replica.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
        merged
    }

    /// Compare two clocks pointwise.
    ///
    /// Replicas missing from either side count as zero.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for (replica, &counter) in &self.counters {
            let theirs = other.get(replica);
            if counter > theirs {
                self_ahead = true;
            } else if counter < theirs {
                other_ahead = true;
            }
        }
        for (replica, &counter) in &other.counters {
            if !self.counters.contains_key(replica) && counter > 0 {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True if `self` is at least as recent as `other` on every counter.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            CausalOrder::After | CausalOrder::Equal
        )
    }
}

impl<R: Into<ReplicaId>> FromIterator<(R, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (R, u64)>>(iter: I) -> Self {
        let counters = iter
            .into_iter()
            .filter(|(_, counter)| *counter > 0)
            .map(|(replica, counter)| (replica.into(), counter))
            .collect();
        Self { counters }
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (replica, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{replica}:{counter}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(r, c)| (*r, *c)).collect()
    }

    #[test]
    fn new_clock_is_empty() {
        let c = VectorClock::new();
        assert!(c.is_empty());
        assert_eq!(c.get("a"), 0);
    }

    #[test]
    fn tick_increments_only_owner() {
        let c = clock(&[("a", 1), ("b", 4)]);
        let next = c.tick("a");
        assert_eq!(next.get("a"), 2);
        assert_eq!(next.get("b"), 4);
        // original untouched
        assert_eq!(c.get("a"), 1);
    }

    #[test]
    fn merge_is_pointwise_max() {
        let a = clock(&[("a", 3), ("b", 1)]);
        let b = clock(&[("b", 5), ("c", 2)]);
        let m = a.merge(&b);
        assert_eq!(m, clock(&[("a", 3), ("b", 5), ("c", 2)]));
    }

    #[test]
    fn compare_equal() {
        assert_eq!(
            clock(&[("a", 1)]).compare(&clock(&[("a", 1)])),
            CausalOrder::Equal
        );
        assert_eq!(VectorClock::new().compare(&VectorClock::new()), CausalOrder::Equal);
    }

    #[test]
    fn compare_before_and_after() {
        let older = clock(&[("a", 1)]);
        let newer = clock(&[("a", 1), ("b", 1)]);
        assert_eq!(older.compare(&newer), CausalOrder::Before);
        assert_eq!(newer.compare(&older), CausalOrder::After);
    }

    #[test]
    fn compare_concurrent() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("b", 1)]);
        assert_eq!(a.compare(&b), CausalOrder::Concurrent);
        assert_eq!(b.compare(&a), CausalOrder::Concurrent);
    }

    #[test]
    fn unseen_replica_counts_as_zero() {
        let a = clock(&[("a", 2)]);
        let with_zero: VectorClock = [("a", 2), ("z", 0)].into_iter().collect();
        assert_eq!(a.compare(&with_zero), CausalOrder::Equal);
        assert_eq!(a, with_zero);
    }

    #[test]
    fn dominates() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1)]);
        assert!(a.dominates(&b));
        assert!(a.dominates(&a));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn display_format() {
        assert_eq!(clock(&[("b", 2), ("a", 1)]).to_string(), "{a:1,b:2}");
    }

    #[test]
    fn serialization_format() {
        let c = clock(&[("b", 2), ("a", 1)]);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"a":1,"b":2}"#);
        let parsed: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, c);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_clock() -> impl Strategy<Value = VectorClock> {
            proptest::collection::btree_map(
                prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")],
                0u64..6,
                0..4,
            )
            .prop_map(|m| m.into_iter().collect())
        }

        proptest! {
            #[test]
            fn prop_merge_commutative(a in arb_clock(), b in arb_clock()) {
                prop_assert_eq!(a.merge(&b), b.merge(&a));
            }

            #[test]
            fn prop_merge_associative(a in arb_clock(), b in arb_clock(), c in arb_clock()) {
                prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
            }

            #[test]
            fn prop_merge_idempotent(a in arb_clock()) {
                prop_assert_eq!(a.merge(&a), a);
            }

            #[test]
            fn prop_merge_dominates_inputs(a in arb_clock(), b in arb_clock()) {
                let m = a.merge(&b);
                prop_assert!(m.dominates(&a));
                prop_assert!(m.dominates(&b));
            }

            #[test]
            fn prop_compare_antisymmetric(a in arb_clock(), b in arb_clock()) {
                let expected = match a.compare(&b) {
                    CausalOrder::Before => CausalOrder::After,
                    CausalOrder::After => CausalOrder::Before,
                    other => other,
                };
                prop_assert_eq!(b.compare(&a), expected);
            }

            #[test]
            fn prop_tick_is_after(a in arb_clock()) {
                prop_assert_eq!(a.tick("a").compare(&a), CausalOrder::After);
            }
        }
    }
}
