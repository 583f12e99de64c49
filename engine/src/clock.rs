//! Vector clocks for causal ordering of operations.
//!
//! Every operation carries the vector clock of its author *after* the
//! operation was made. Clocks are compared per client counter; two clocks that
//! each know something the other does not are concurrent.
//!
//! Clocks are bounded to [`MAX_VECTOR_CLOCK_SIZE`] entries. Pruning drops the
//! clients with the lowest counters, so comparison between two clocks that are
//! both at the cap treats a missing key as *unknown* rather than zero.

use crate::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of client entries a clock may carry.
///
/// All clients must agree on this value.
pub const MAX_VECTOR_CLOCK_SIZE: usize = 10;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockComparison {
    /// Left happened before right.
    LessThan,
    /// Left happened after right.
    GreaterThan,
    /// Identical causal position.
    Equal,
    /// Neither dominates.
    Concurrent,
}

impl ClockComparison {
    /// The comparison seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            ClockComparison::LessThan => ClockComparison::GreaterThan,
            ClockComparison::GreaterThan => ClockComparison::LessThan,
            other => other,
        }
    }
}

/// A mapping from client id to a monotonically increasing counter.
///
/// Backed by a `BTreeMap` so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ClientId, u64>);

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(client, counter)` pairs.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<ClientId>,
    {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Counter for a client, zero if absent.
    pub fn get(&self, client_id: &str) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.0.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.0.iter()
    }

    /// Compare against another clock using the protocol size cap.
    pub fn compare(&self, other: &VectorClock) -> ClockComparison {
        self.compare_with_cap(other, MAX_VECTOR_CLOCK_SIZE)
    }

    /// Compare against another clock, pruning-aware at the given cap.
    ///
    /// When both clocks are at the cap, either one may have been pruned. If
    /// both carry keys the other lacks, the missing entries may have been
    /// evicted rather than never seen, so the result is forced to
    /// [`ClockComparison::Concurrent`]. In every other case a missing key
    /// counts as zero.
    pub fn compare_with_cap(&self, other: &VectorClock, cap: usize) -> ClockComparison {
        if self.len() >= cap && other.len() >= cap {
            let self_only = self.0.keys().any(|k| !other.0.contains_key(k));
            let other_only = other.0.keys().any(|k| !self.0.contains_key(k));
            if self_only && other_only {
                return ClockComparison::Concurrent;
            }
        }

        let mut self_greater = false;
        let mut other_greater = false;

        for key in self.0.keys().chain(other.0.keys()) {
            let a = self.get(key);
            let b = other.get(key);
            if a > b {
                self_greater = true;
            } else if b > a {
                other_greater = true;
            }
            if self_greater && other_greater {
                return ClockComparison::Concurrent;
            }
        }

        match (self_greater, other_greater) {
            (false, false) => ClockComparison::Equal,
            (true, false) => ClockComparison::GreaterThan,
            (false, true) => ClockComparison::LessThan,
            (true, true) => ClockComparison::Concurrent,
        }
    }

    /// Per-key maximum of both clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.merge_in_place(other);
        merged
    }

    pub(crate) fn merge_in_place(&mut self, other: &VectorClock) {
        for (client, &counter) in &other.0 {
            let entry = self.0.entry(client.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Merge any number of clocks.
    pub fn merge_all<'a>(clocks: impl IntoIterator<Item = &'a VectorClock>) -> VectorClock {
        let mut merged = VectorClock::new();
        for clock in clocks {
            merged.merge_in_place(clock);
        }
        merged
    }

    /// A copy of this clock with `client_id`'s counter advanced by one.
    pub fn increment(&self, client_id: &str) -> VectorClock {
        let mut next = self.clone();
        *next.0.entry(client_id.to_string()).or_insert(0) += 1;
        next
    }

    /// Clients ranked by descending counter, ties by ascending id.
    fn ranked(&self) -> Vec<(&ClientId, u64)> {
        let mut ranked: Vec<_> = self.0.iter().map(|(k, &v)| (k, v)).collect();
        ranked.sort_by(|(a_id, a), (b_id, b)| b.cmp(a).then_with(|| a_id.cmp(b_id)));
        ranked
    }

    /// Up to `max_count` client ids that must survive pruning.
    ///
    /// Ranked by descending counter, ties broken by ascending client id.
    pub fn select_protected_ids(&self, max_count: usize) -> Vec<ClientId> {
        self.ranked()
            .into_iter()
            .take(max_count)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Bound the clock to [`MAX_VECTOR_CLOCK_SIZE`] entries.
    pub fn limit_size(&self, current_client_id: &str, protected_ids: &[ClientId]) -> VectorClock {
        self.limit_size_to(MAX_VECTOR_CLOCK_SIZE, current_client_id, protected_ids)
    }

    /// Bound the clock to `cap` entries.
    ///
    /// Retains the current client, then every protected id present in the
    /// clock, then fills the remaining slots by rank. The result never exceeds
    /// `cap`; callers keep `protected_ids` at `cap - 1` or fewer so that
    /// nothing protected is dropped.
    pub fn limit_size_to(
        &self,
        cap: usize,
        current_client_id: &str,
        protected_ids: &[ClientId],
    ) -> VectorClock {
        if self.len() <= cap {
            return self.clone();
        }

        let mut kept = BTreeMap::new();
        if let Some(&counter) = self.0.get(current_client_id) {
            kept.insert(current_client_id.to_string(), counter);
        }
        for id in protected_ids {
            if kept.len() >= cap {
                break;
            }
            if let Some(&counter) = self.0.get(id) {
                kept.insert(id.clone(), counter);
            }
        }
        for (id, counter) in self.ranked() {
            if kept.len() >= cap {
                break;
            }
            kept.entry(id.clone()).or_insert(counter);
        }

        tracing::debug!(
            before = self.len(),
            after = kept.len(),
            "pruned vector clock"
        );
        VectorClock(kept)
    }

    /// Whether `self` advanced past `reference`.
    ///
    /// True iff some counter is strictly higher than in `reference`, or `self`
    /// is non-empty while `reference` is absent or empty. An empty `self`
    /// against a non-empty reference is not a change.
    pub fn has_changes(&self, reference: Option<&VectorClock>) -> bool {
        match reference {
            None => !self.is_empty(),
            Some(reference) if reference.is_empty() => !self.is_empty(),
            Some(reference) => self
                .0
                .iter()
                .any(|(client, &counter)| counter > reference.get(client)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|&(k, v)| (k, v)))
    }

    fn numbered(prefix: &str, range: std::ops::Range<u64>) -> VectorClock {
        VectorClock::from_entries(range.map(|i| (format!("{prefix}_{i}"), i + 1)))
    }

    #[test]
    fn compare_equal() {
        let a = vc(&[("a", 1), ("b", 2)]);
        assert_eq!(a.compare(&a.clone()), ClockComparison::Equal);
        assert_eq!(
            VectorClock::new().compare(&VectorClock::new()),
            ClockComparison::Equal
        );
    }

    #[test]
    fn compare_less_and_greater() {
        let a = vc(&[("a", 1)]);
        let b = vc(&[("a", 2)]);
        assert_eq!(a.compare(&b), ClockComparison::LessThan);
        assert_eq!(b.compare(&a), ClockComparison::GreaterThan);
    }

    #[test]
    fn missing_keys_count_as_zero() {
        let a = vc(&[("a", 1)]);
        let b = vc(&[("a", 1), ("b", 1)]);
        assert_eq!(a.compare(&b), ClockComparison::LessThan);
        assert_eq!(vc(&[("a", 1), ("b", 0)]).compare(&a), ClockComparison::Equal);
    }

    #[test]
    fn compare_concurrent() {
        let import = vc(&[("a", 1)]);
        let op = vc(&[("b", 7)]);
        assert_eq!(op.compare(&import), ClockComparison::Concurrent);
        assert_eq!(import.compare(&op), ClockComparison::Concurrent);
    }

    #[test]
    fn both_at_cap_with_exclusive_keys_is_concurrent() {
        // b dominates every shared key, but each side has a key the other lacks
        let mut a = numbered("c", 0..9);
        a = a.merge(&vc(&[("only_a", 1)]));
        let mut b = numbered("c", 0..9).increment("c_0");
        b = b.merge(&vc(&[("only_b", 50)]));
        assert_eq!(a.len(), MAX_VECTOR_CLOCK_SIZE);
        assert_eq!(b.len(), MAX_VECTOR_CLOCK_SIZE);

        assert_eq!(a.compare(&b), ClockComparison::Concurrent);

        // d is ahead on every counter, yet c's zero entry for a key d lacks
        // may stand for evicted history once both are at the cap
        let c = numbered("c", 0..9).merge(&vc(&[("only_a", 0)]));
        let mut d = VectorClock::new();
        for (k, v) in numbered("c", 0..9).iter() {
            d = d.merge(&vc(&[(k.as_str(), v + 10)]));
        }
        d = d.merge(&vc(&[("only_b", 1)]));
        assert_eq!(c.compare_with_cap(&d, 100), ClockComparison::LessThan);
        assert_eq!(c.compare(&d), ClockComparison::Concurrent);
    }

    #[test]
    fn only_one_side_at_cap_uses_zero_default() {
        let full = numbered("c", 0..10);
        let small = vc(&[("c_0", 1)]);
        assert_eq!(full.compare(&small), ClockComparison::GreaterThan);
        assert_eq!(small.compare(&full), ClockComparison::LessThan);
    }

    #[test]
    fn merge_takes_per_key_max() {
        let a = vc(&[("a", 3), ("b", 1)]);
        let b = vc(&[("b", 4), ("c", 2)]);
        assert_eq!(a.merge(&b), vc(&[("a", 3), ("b", 4), ("c", 2)]));
        assert_eq!(
            VectorClock::merge_all([&a, &b, &VectorClock::new()]),
            vc(&[("a", 3), ("b", 4), ("c", 2)])
        );
    }

    #[test]
    fn increment_only_touches_one_client() {
        let a = vc(&[("a", 3), ("b", 1)]);
        let next = a.increment("a");
        assert_eq!(next, vc(&[("a", 4), ("b", 1)]));
        assert_eq!(a.get("a"), 3);
        assert_eq!(VectorClock::new().increment("z").get("z"), 1);
    }

    #[test]
    fn select_protected_ids_is_rank_stable() {
        let clock = vc(&[("a", 5), ("b", 3), ("c", 1), ("d", 4), ("e", 2)]);
        assert_eq!(clock.select_protected_ids(3), vec!["a", "d", "b"]);

        let ties = vc(&[("z", 2), ("m", 2), ("a", 2)]);
        assert_eq!(ties.select_protected_ids(2), vec!["a", "m"]);
    }

    #[test]
    fn select_protected_ids_keeps_highest_counters() {
        let clock = numbered("client", 0..15);
        let expected: Vec<_> = (6..15).rev().map(|i| format!("client_{i}")).collect();
        assert_eq!(clock.select_protected_ids(9), expected);
    }

    #[test]
    fn limit_size_under_cap_is_unchanged() {
        let clock = numbered("c", 0..5);
        assert_eq!(clock.limit_size("c_0", &[]), clock);
    }

    #[test]
    fn limit_size_keeps_current_and_protected() {
        let clock = numbered("c", 0..15);
        let protected = vec!["c_1".to_string(), "c_2".to_string()];
        let pruned = clock.limit_size("c_0", &protected);

        assert_eq!(pruned.len(), MAX_VECTOR_CLOCK_SIZE);
        assert!(pruned.contains("c_0"));
        assert!(pruned.contains("c_1"));
        assert!(pruned.contains("c_2"));
        // remaining 7 slots go to the highest counters
        for i in 8..15 {
            assert!(pruned.contains(&format!("c_{i}")));
        }
        assert!(!pruned.contains("c_7"));
    }

    #[test]
    fn limit_size_never_exceeds_cap() {
        let clock = numbered("c", 0..20);
        let protected: Vec<_> = (0..15).map(|i| format!("c_{i}")).collect();
        let pruned = clock.limit_size("c_19", &protected);
        assert_eq!(pruned.len(), MAX_VECTOR_CLOCK_SIZE);
        assert!(pruned.contains("c_19"));
    }

    #[test]
    fn has_changes_is_asymmetric() {
        let empty = VectorClock::new();
        let a = vc(&[("a", 1)]);
        assert!(a.has_changes(None));
        assert!(a.has_changes(Some(&empty)));
        assert!(!empty.has_changes(Some(&a)));
        assert!(!empty.has_changes(None));

        assert!(vc(&[("a", 2)]).has_changes(Some(&a)));
        assert!(!a.has_changes(Some(&vc(&[("a", 1), ("b", 9)]))));
        assert!(vc(&[("b", 1)]).has_changes(Some(&a)));
    }

    #[test]
    fn serialization_is_a_plain_map() {
        let clock = vc(&[("b", 2), ("a", 1)]);
        let json = serde_json::to_string(&clock).unwrap();
        assert_eq!(json, r#"{"a":1,"b":2}"#);
        let parsed: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, clock);
    }

    mod property_tests {
        use super::*;
        use proptest::collection::btree_map;
        use proptest::prelude::*;

        fn arb_clock() -> impl Strategy<Value = VectorClock> {
            btree_map("[a-l]", 0u64..20, 0..14).prop_map(VectorClock)
        }

        proptest! {
            #[test]
            fn prop_compare_reflexive(a in arb_clock()) {
                prop_assert_eq!(a.compare(&a), ClockComparison::Equal);
            }

            #[test]
            fn prop_compare_antisymmetric(a in arb_clock(), b in arb_clock()) {
                prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
            }

            #[test]
            fn prop_merge_dominates_inputs(a in arb_clock(), b in arb_clock()) {
                let merged = a.merge(&b);
                let vs_a = merged.compare_with_cap(&a, usize::MAX);
                let vs_b = merged.compare_with_cap(&b, usize::MAX);
                prop_assert!(matches!(vs_a, ClockComparison::GreaterThan | ClockComparison::Equal));
                prop_assert!(matches!(vs_b, ClockComparison::GreaterThan | ClockComparison::Equal));
            }

            #[test]
            fn prop_pruning_keeps_current_and_protected(
                clock in arb_clock(),
                current in "[a-l]",
                protected_count in 0usize..MAX_VECTOR_CLOCK_SIZE,
            ) {
                let protected = clock
                    .select_protected_ids(MAX_VECTOR_CLOCK_SIZE + 4)
                    .into_iter()
                    .rev()
                    .filter(|id| *id != current)
                    .take(protected_count.min(MAX_VECTOR_CLOCK_SIZE - 1))
                    .collect::<Vec<_>>();
                let pruned = clock.limit_size(&current, &protected);

                prop_assert!(pruned.len() <= MAX_VECTOR_CLOCK_SIZE);
                if clock.contains(&current) {
                    prop_assert!(pruned.contains(&current));
                }
                for id in &protected {
                    prop_assert!(pruned.contains(id));
                }
            }
        }
    }
}
