// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The resource reference tracker.
//!
//! A bipartite graph between logical flows and the external symbols they
//! touched while compiling, stored as two maps so both directions are
//! O(1): symbol → referring flows (with the address-set occurrence
//! count), and flow → referenced symbols. Every edge lives in both maps;
//! removing a flow walks its edge list and garbage-collects symbols that
//! lose their last referrer.

use ahash::RandomState;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The kind of symbol a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    AddrSet,
    PortGroup,
    PortBinding,
    McastGroup,
}

#[derive(Debug, Default)]
pub struct RefTracker {
    by_symbol: HashMap<(RefType, String), HashMap<Uuid, usize, RandomState>, RandomState>,
    by_flow: HashMap<Uuid, HashSet<(RefType, String), RandomState>, RandomState>,
}

impl RefTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `flow` references `(ref_type, name)`. Idempotent: a
    /// second add for the same edge leaves the recorded count untouched
    /// (the count comes from the parser and is fixed per compilation).
    pub fn add(&mut self, ref_type: RefType, name: &str, flow: Uuid, ref_count: usize) {
        let key = (ref_type, name.to_string());
        let referrers = self.by_symbol.entry(key.clone()).or_default();
        if referrers.contains_key(&flow) {
            return;
        }
        referrers.insert(flow, ref_count);
        self.by_flow.entry(flow).or_default().insert(key);
    }

    /// Drop every reference originating at `flow`, purging symbols whose
    /// referrer set becomes empty.
    pub fn remove_all_for_flow(&mut self, flow: &Uuid) {
        let Some(keys) = self.by_flow.remove(flow) else {
            return;
        };
        for key in keys {
            if let Some(referrers) = self.by_symbol.get_mut(&key) {
                referrers.remove(flow);
                if referrers.is_empty() {
                    self.by_symbol.remove(&key);
                }
            }
        }
    }

    /// The flows referring to `(ref_type, name)`, with their recorded
    /// address-set occurrence counts, in stable (uuid) order.
    #[must_use]
    pub fn lookup_by_symbol(&self, ref_type: RefType, name: &str) -> Vec<(Uuid, usize)> {
        let mut out: Vec<(Uuid, usize)> = self
            .by_symbol
            .get(&(ref_type, name.to_string()))
            .map(|referrers| referrers.iter().map(|(u, c)| (*u, *c)).collect())
            .unwrap_or_default();
        out.sort_unstable_by_key(|(u, _)| *u);
        out
    }

    /// Whether `flow` recorded any reference at all.
    #[must_use]
    pub fn flow_has_refs(&self, flow: &Uuid) -> bool {
        self.by_flow.contains_key(flow)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.by_symbol.clear();
        self.by_flow.clear();
    }

    #[cfg(test)]
    fn symmetric(&self) -> bool {
        self.by_symbol.iter().all(|(key, referrers)| {
            referrers
                .keys()
                .all(|flow| self.by_flow.get(flow).is_some_and(|ks| ks.contains(key)))
        }) && self.by_flow.iter().all(|(flow, keys)| {
            keys.iter().all(|key| {
                self.by_symbol
                    .get(key)
                    .is_some_and(|referrers| referrers.contains_key(flow))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let mut t = RefTracker::new();
        let f = Uuid::new_v4();
        t.add(RefType::AddrSet, "as1", f, 2);
        t.add(RefType::AddrSet, "as1", f, 7);
        assert_eq!(t.lookup_by_symbol(RefType::AddrSet, "as1"), vec![(f, 2)]);
        assert!(t.symmetric());
    }

    #[test]
    fn removal_cascades_and_purges() {
        let mut t = RefTracker::new();
        let f1 = Uuid::new_v4();
        let f2 = Uuid::new_v4();
        t.add(RefType::AddrSet, "as1", f1, 1);
        t.add(RefType::AddrSet, "as1", f2, 1);
        t.add(RefType::PortBinding, "lp1", f1, 0);
        assert!(t.symmetric());

        t.remove_all_for_flow(&f1);
        assert!(!t.flow_has_refs(&f1));
        assert!(t.symmetric());
        assert_eq!(t.lookup_by_symbol(RefType::AddrSet, "as1"), vec![(f2, 1)]);
        // lp1 lost its last referrer and is gone entirely.
        assert!(t.lookup_by_symbol(RefType::PortBinding, "lp1").is_empty());

        t.remove_all_for_flow(&f2);
        assert!(t.lookup_by_symbol(RefType::AddrSet, "as1").is_empty());
    }

    #[test]
    fn types_partition_the_namespace() {
        let mut t = RefTracker::new();
        let f = Uuid::new_v4();
        t.add(RefType::AddrSet, "x", f, 1);
        assert!(t.lookup_by_symbol(RefType::PortGroup, "x").is_empty());
    }
}
