// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The extend table: a bounded associative id allocator.
//!
//! Meters and groups referenced by name from logical flows are interned
//! into a finite id space. Each assignment is keyed by `(name, flow)` so
//! that removing a flow's references can free ids nobody else uses.

use ahash::RandomState;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct ExtendTable {
    capacity: u32,
    by_name: HashMap<String, u32, RandomState>,
    in_use: HashSet<u32, RandomState>,
    name_refs: HashMap<String, HashSet<Uuid, RandomState>, RandomState>,
    flow_refs: HashMap<Uuid, HashSet<String, RandomState>, RandomState>,
}

impl ExtendTable {
    /// A table with ids `1..=capacity`.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            by_name: HashMap::with_hasher(RandomState::with_seed(0)),
            in_use: HashSet::with_hasher(RandomState::with_seed(0)),
            name_refs: HashMap::with_hasher(RandomState::with_seed(0)),
            flow_refs: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    /// Intern `name` for `flow`. Returns `None` when the id space is
    /// exhausted (the caller emits without the resource).
    pub fn assign_id(&mut self, name: &str, flow: Uuid) -> Option<u32> {
        let id = match self.by_name.get(name) {
            Some(id) => *id,
            None => {
                let id = (1..=self.capacity).find(|id| !self.in_use.contains(id))?;
                self.in_use.insert(id);
                self.by_name.insert(name.to_string(), id);
                id
            }
        };
        self.name_refs
            .entry(name.to_string())
            .or_default()
            .insert(flow);
        self.flow_refs
            .entry(flow)
            .or_default()
            .insert(name.to_string());
        Some(id)
    }

    /// The id assigned to `name`, if any.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Drop every reference held by `flow`, releasing ids that lose
    /// their last referrer.
    pub fn remove_flow_refs(&mut self, flow: &Uuid) {
        let Some(names) = self.flow_refs.remove(flow) else {
            return;
        };
        for name in names {
            let empty = self
                .name_refs
                .get_mut(&name)
                .map(|flows| {
                    flows.remove(flow);
                    flows.is_empty()
                })
                .unwrap_or(false);
            if empty {
                self.name_refs.remove(&name);
                if let Some(id) = self.by_name.remove(&name) {
                    debug!("releasing extend-table id {id} for '{name}'");
                    self.in_use.remove(&id);
                }
            }
        }
    }
}
