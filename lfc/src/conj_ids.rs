// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Conjunction id allocation.
//!
//! Conjunction ids are 32-bit values shared by every clause of one
//! OpenFlow conjunction. Each compiled `(flow, datapath)` pair owns a
//! contiguous range; the ranges of live pairs never overlap. Freed
//! ranges are reused, lowest first, which keeps allocation deterministic
//! for a given history. Id 0 is never allocated.

use ahash::RandomState;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ConjIdAllocator {
    in_use: HashSet<u32, RandomState>,
    ranges: HashMap<(Uuid, Uuid), (u32, u32), RandomState>,
}

impl ConjIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `n` consecutive ids for `(flow, dp)` and return the
    /// first. A range already held by the pair is released first.
    ///
    /// # Panics
    ///
    /// Panics when the 32-bit id space is exhausted. A deployment with
    /// four billion live conjunctive flows is not a state this process
    /// can limp through.
    pub fn alloc(&mut self, flow: Uuid, dp: Uuid, n: u32) -> u32 {
        assert!(n > 0, "conjunction range cannot be empty");
        self.free(&(flow, dp));
        let mut first: u32 = 1;
        loop {
            match self.range_conflict(first, n) {
                None => break,
                Some(conflict) => {
                    first = conflict
                        .checked_add(1)
                        .unwrap_or_else(|| panic!("32-bit conjunction ids exhausted"));
                    assert!(
                        u64::from(first) + u64::from(n) <= u64::from(u32::MAX),
                        "32-bit conjunction ids exhausted"
                    );
                }
            }
        }
        self.take(flow, dp, first, n);
        first
    }

    /// Reserve a specific range for `(flow, dp)`; used when replaying a
    /// cached compilation. Succeeds when the pair already holds exactly
    /// this range, or when every id in it is free.
    pub fn alloc_specified(&mut self, flow: Uuid, dp: Uuid, first: u32, n: u32) -> bool {
        if first == 0 || n == 0 {
            return false;
        }
        let key = (flow, dp);
        if self.ranges.get(&key) == Some(&(first, n)) {
            return true;
        }
        if self.ranges.contains_key(&key) || self.range_conflict(first, n).is_some() {
            return false;
        }
        self.take(flow, dp, first, n);
        true
    }

    /// The first id of the range held by `(flow, dp)`, if any.
    #[must_use]
    pub fn find(&self, flow: &Uuid, dp: &Uuid) -> Option<u32> {
        self.ranges.get(&(*flow, *dp)).map(|(first, _)| *first)
    }

    /// Release every range owned by `flow`, on all datapaths.
    pub fn free_for_flow(&mut self, flow: &Uuid) {
        let keys: Vec<(Uuid, Uuid)> = self
            .ranges
            .keys()
            .filter(|(f, _)| f == flow)
            .copied()
            .collect();
        for key in keys {
            self.free(&key);
        }
    }

    /// Ids currently allocated, for consistency checks.
    #[must_use]
    pub fn n_allocated(&self) -> usize {
        self.in_use.len()
    }

    fn free(&mut self, key: &(Uuid, Uuid)) {
        if let Some((first, n)) = self.ranges.remove(key) {
            for id in first..first + n {
                self.in_use.remove(&id);
            }
        }
    }

    fn take(&mut self, flow: Uuid, dp: Uuid, first: u32, n: u32) {
        for id in first..first + n {
            self.in_use.insert(id);
        }
        self.ranges.insert((flow, dp), (first, n));
    }

    /// The highest conflicting id in `[first, first + n)`, or `None`
    /// when the whole range is free.
    fn range_conflict(&self, first: u32, n: u32) -> Option<u32> {
        (first..first + n)
            .rev()
            .find(|id| self.in_use.contains(id))
    }
}
