// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-flow compilation cache.
//!
//! Each logical flow may cache one artifact: its parsed expression tree
//! (when only port lookups made the result chassis-dependent) or its
//! fully normalized matches with the conjunction range they were
//! numbered against (when nothing external was referenced). Entries
//! carry a byte estimate against a global budget; over budget, the cache
//! prefers discarding expression trees over matches and older entries
//! over newer ones within a state.
//!
//! Callers never probe for presence except through [`LflowCache::get`];
//! a cached `Matches` entry must be revalidated against the conjunction
//! allocator before use and deleted on failure.

use ahash::RandomState;
use expr::{Expr, ExprMatch};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// A cached artifact.
#[derive(Debug, Clone)]
pub enum CacheValue {
    Expr {
        expr: Expr,
        size_bytes: usize,
    },
    Matches {
        matches: Vec<ExprMatch>,
        conj_id_ofs: u32,
        n_conjs: u32,
        size_bytes: usize,
    },
}

impl CacheValue {
    fn size_bytes(&self) -> usize {
        match self {
            CacheValue::Expr { size_bytes, .. } | CacheValue::Matches { size_bytes, .. } => {
                *size_bytes
            }
        }
    }

    fn is_expr(&self) -> bool {
        matches!(self, CacheValue::Expr { .. })
    }
}

#[derive(Debug)]
struct Entry {
    value: CacheValue,
    /// Insertion sequence, used as the eviction age.
    seq: u64,
}

/// Hit/miss counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct LflowCache {
    enabled: bool,
    budget_bytes: usize,
    used_bytes: usize,
    next_seq: u64,
    entries: HashMap<Uuid, Entry, RandomState>,
    stats: CacheStats,
}

impl LflowCache {
    /// A cache holding up to roughly `budget_bytes` of artifacts; a
    /// budget of 0 disables caching entirely.
    #[must_use]
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            enabled: budget_bytes > 0,
            budget_bytes,
            used_bytes: 0,
            next_seq: 0,
            entries: HashMap::with_hasher(RandomState::with_seed(0)),
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the artifact for `flow`.
    pub fn get(&mut self, flow: &Uuid) -> Option<&CacheValue> {
        if !self.enabled {
            return None;
        }
        match self.entries.get(flow) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(&entry.value)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Cache the parsed expression tree for `flow`.
    pub fn add_expr(&mut self, flow: Uuid, expr: Expr) {
        let size_bytes = expr.size_bytes();
        self.insert(flow, CacheValue::Expr { expr, size_bytes });
    }

    /// Cache fully normalized matches for `flow`, recording the
    /// conjunction range they are numbered against.
    pub fn add_matches(
        &mut self,
        flow: Uuid,
        matches: Vec<ExprMatch>,
        conj_id_ofs: u32,
        n_conjs: u32,
    ) {
        let size_bytes = matches.iter().map(ExprMatch::size_bytes).sum();
        self.insert(
            flow,
            CacheValue::Matches {
                matches,
                conj_id_ofs,
                n_conjs,
                size_bytes,
            },
        );
    }

    /// Drop the entry for `flow`, if any.
    pub fn delete(&mut self, flow: &Uuid) {
        if let Some(entry) = self.entries.remove(flow) {
            self.used_bytes -= entry.value.size_bytes();
        }
    }

    /// Drop every entry.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    fn insert(&mut self, flow: Uuid, value: CacheValue) {
        if !self.enabled {
            return;
        }
        self.delete(&flow);
        self.used_bytes += value.size_bytes();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(flow, Entry { value, seq });
        self.trim();
    }

    /// Evict until the budget holds: expression entries before match
    /// entries, oldest first within each state.
    fn trim(&mut self) {
        while self.used_bytes > self.budget_bytes && !self.entries.is_empty() {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| (!e.value.is_expr(), e.seq))
                .map(|(u, _)| *u);
            let Some(victim) = victim else {
                return;
            };
            debug!("cache over budget, evicting {victim}");
            self.delete(&victim);
        }
    }
}
