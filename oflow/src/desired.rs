// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The desired flow table and the sink contract the compiler emits into.
//!
//! Flows are content-addressed by `(table, priority, match)`: emitting
//! the same flow twice collapses into one entry with the union of the
//! owners. Every entry carries the uuids of the logical rows that
//! produced it so that removal-by-owner and flood removal can cascade
//! without re-running the compiler.

use crate::action::OfAction;
use crate::fmatch::Match;
use ahash::RandomState;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// The address-set provenance tag of a flow, used to delete flows for
/// individual removed addresses without recompiling their logical flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsInfo {
    pub name: String,
    pub ip: u128,
    pub mask: u128,
}

/// One conjunction clause membership of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Conjunction {
    pub id: u32,
    pub clause: u8,
    pub n_clauses: u8,
}

/// The sink the compiler writes desired flows into.
///
/// Cookie addressing: every flow is tagged with the full uuid of its
/// owning row, and the wire cookie is the low 32 bits of that uuid.
pub trait FlowSink {
    /// Add a flow with concrete actions.
    fn add_flow(
        &mut self,
        table_id: u8,
        priority: u16,
        fmatch: Match,
        actions: Vec<OfAction>,
        owner: Uuid,
    ) {
        self.add_flow_metered(table_id, priority, fmatch, actions, None, owner, None);
    }

    /// Add a flow with concrete actions, an optional controller meter and
    /// an optional address-set provenance tag.
    #[allow(clippy::too_many_arguments)]
    fn add_flow_metered(
        &mut self,
        table_id: u8,
        priority: u16,
        fmatch: Match,
        actions: Vec<OfAction>,
        meter_id: Option<u32>,
        owner: Uuid,
        as_info: Option<AsInfo>,
    );

    /// Add a flow whose actions may be conjunction clauses; if a flow
    /// with the same `(table, priority, match)` already exists, the
    /// conjunction clauses are merged into it instead.
    #[allow(clippy::too_many_arguments)]
    fn add_or_append_flow(
        &mut self,
        table_id: u8,
        priority: u16,
        fmatch: Match,
        actions: Vec<OfAction>,
        meter_id: Option<u32>,
        owner: Uuid,
        as_info: Option<AsInfo>,
    );

    /// Remove every flow owned by `owner`.
    fn remove_flows(&mut self, owner: &Uuid);

    /// Remove the flows owned by `owner` that are tagged with `as_info`.
    /// Returns false when the number of removed flows differs from
    /// `ref_count`, signalling that the caller must fall back to a full
    /// recompilation.
    fn remove_flows_for_as_ip(&mut self, owner: &Uuid, as_info: &AsInfo, ref_count: usize)
        -> bool;

    /// Remove every flow owned by any id in `owners`, expanding the set
    /// with co-owners of removed flows: a flow shared between logical
    /// rows must be recompiled by every row that contributed to it.
    fn flood_remove_flows(&mut self, owners: &mut BTreeSet<Uuid>);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    table_id: u8,
    priority: u16,
    fmatch: Match,
}

#[derive(Debug, Clone)]
struct FlowEntry {
    actions: Vec<OfAction>,
    meter_id: Option<u32>,
    cookie: u32,
    /// Owning row uuids with their address-set provenance, if any.
    owners: HashMap<Uuid, Option<AsInfo>, RandomState>,
}

/// Low 32 bits of a row uuid, the wire cookie.
#[must_use]
pub fn uuid_cookie(uuid: &Uuid) -> u32 {
    uuid.as_u128() as u32
}

/// Keep conjunction clauses in `(id, clause)` order so that the action
/// list of a merged flow does not depend on the order the owners were
/// compiled in.
fn canonicalize_conjunctions(actions: &mut Vec<OfAction>) {
    if actions
        .iter()
        .filter(|a| matches!(a, OfAction::Conjunction { .. }))
        .count()
        < 2
    {
        return;
    }
    actions.sort_by_key(|a| match a {
        OfAction::Conjunction { id, clause, .. } => (1u8, *id, *clause),
        _ => (0, 0, 0),
    });
}

/// The content-addressed desired flow table.
#[derive(Debug, Default)]
pub struct DesiredFlowTable {
    flows: HashMap<FlowKey, FlowEntry, RandomState>,
    by_owner: HashMap<Uuid, HashSet<FlowKey, RandomState>, RandomState>,
}

impl DesiredFlowTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of desired flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// True when no flow is desired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Drop every flow and owner reference.
    pub fn clear(&mut self) {
        self.flows.clear();
        self.by_owner.clear();
    }

    fn link_owner(&mut self, owner: Uuid, key: &FlowKey) {
        self.by_owner
            .entry(owner)
            .or_default()
            .insert(key.clone());
    }

    fn insert(
        &mut self,
        key: FlowKey,
        actions: Vec<OfAction>,
        meter_id: Option<u32>,
        owner: Uuid,
        as_info: Option<AsInfo>,
        append: bool,
    ) {
        if let Some(entry) = self.flows.get_mut(&key) {
            if append {
                // Merge conjunction clauses this owner contributes; any
                // other duplicate actions collapse into the entry already
                // present.
                for act in actions {
                    if matches!(act, OfAction::Conjunction { .. })
                        && !entry.actions.contains(&act)
                    {
                        entry.actions.push(act);
                    }
                }
                canonicalize_conjunctions(&mut entry.actions);
            } else if entry.actions != actions {
                debug!(
                    "duplicate flow {} with different actions, keeping first",
                    key.fmatch
                );
            }
            entry.owners.entry(owner).or_insert(as_info);
        } else {
            let mut owners = HashMap::with_hasher(RandomState::with_seed(0));
            owners.insert(owner, as_info);
            let mut actions = actions;
            canonicalize_conjunctions(&mut actions);
            self.flows.insert(
                key.clone(),
                FlowEntry {
                    actions,
                    meter_id,
                    cookie: uuid_cookie(&owner),
                    owners,
                },
            );
        }
        self.link_owner(owner, &key);
    }

    fn remove_key_owner(&mut self, key: &FlowKey, owner: &Uuid) {
        if let Some(entry) = self.flows.get_mut(key) {
            entry.owners.remove(owner);
            if entry.owners.is_empty() {
                self.flows.remove(key);
            }
        }
        if let Some(keys) = self.by_owner.get_mut(owner) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_owner.remove(owner);
            }
        }
    }

    /// Iterate over the desired flows as views.
    pub fn iter(&self) -> impl Iterator<Item = DesiredFlow<'_>> + '_ {
        self.flows.iter().map(|(key, entry)| DesiredFlow {
            table_id: key.table_id,
            priority: key.priority,
            fmatch: &key.fmatch,
            actions: &entry.actions,
            meter_id: entry.meter_id,
            cookie: entry.cookie,
            owners: &entry.owners,
        })
    }

    /// The flows owned by `owner`.
    pub fn flows_for_owner<'a>(
        &'a self,
        owner: &Uuid,
    ) -> impl Iterator<Item = DesiredFlow<'a>> + 'a {
        let keys: Vec<FlowKey> = self
            .by_owner
            .get(owner)
            .map(|ks| ks.iter().cloned().collect())
            .unwrap_or_default();
        keys.into_iter().filter_map(move |key| {
            self.flows.get_key_value(&key).map(|(k, entry)| DesiredFlow {
                table_id: k.table_id,
                priority: k.priority,
                fmatch: &k.fmatch,
                actions: &entry.actions,
                meter_id: entry.meter_id,
                cookie: entry.cookie,
                owners: &entry.owners,
            })
        })
    }

    /// A sorted, human-readable rendering of the whole table. Two tables
    /// with the same desired flows render identically; tests compare
    /// these snapshots.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut out: Vec<String> = self.iter().map(|f| f.to_string()).collect();
        out.sort();
        out
    }
}

/// A borrowed view of one desired flow.
#[derive(Debug, Clone, Copy)]
pub struct DesiredFlow<'a> {
    pub table_id: u8,
    pub priority: u16,
    pub fmatch: &'a Match,
    pub actions: &'a [OfAction],
    pub meter_id: Option<u32>,
    pub cookie: u32,
    pub owners: &'a HashMap<Uuid, Option<AsInfo>, RandomState>,
}

impl fmt::Display for DesiredFlow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table={} priority={} match[{}] actions{:?}",
            self.table_id, self.priority, self.fmatch, self.actions
        )?;
        if let Some(m) = self.meter_id {
            write!(f, " meter={m}")?;
        }
        Ok(())
    }
}

impl FlowSink for DesiredFlowTable {
    fn add_flow_metered(
        &mut self,
        table_id: u8,
        priority: u16,
        fmatch: Match,
        actions: Vec<OfAction>,
        meter_id: Option<u32>,
        owner: Uuid,
        as_info: Option<AsInfo>,
    ) {
        let key = FlowKey {
            table_id,
            priority,
            fmatch,
        };
        self.insert(key, actions, meter_id, owner, as_info, false);
    }

    fn add_or_append_flow(
        &mut self,
        table_id: u8,
        priority: u16,
        fmatch: Match,
        actions: Vec<OfAction>,
        meter_id: Option<u32>,
        owner: Uuid,
        as_info: Option<AsInfo>,
    ) {
        let key = FlowKey {
            table_id,
            priority,
            fmatch,
        };
        self.insert(key, actions, meter_id, owner, as_info, true);
    }

    fn remove_flows(&mut self, owner: &Uuid) {
        let keys: Vec<FlowKey> = self
            .by_owner
            .get(owner)
            .map(|ks| ks.iter().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            self.remove_key_owner(&key, owner);
        }
    }

    fn remove_flows_for_as_ip(
        &mut self,
        owner: &Uuid,
        as_info: &AsInfo,
        ref_count: usize,
    ) -> bool {
        let keys: Vec<FlowKey> = self
            .by_owner
            .get(owner)
            .map(|ks| ks.iter().cloned().collect())
            .unwrap_or_default();
        let mut removed = 0usize;
        for key in keys {
            let tagged = self
                .flows
                .get(&key)
                .and_then(|entry| entry.owners.get(owner))
                .and_then(|info| info.as_ref())
                .is_some_and(|info| info == as_info);
            if tagged {
                self.remove_key_owner(&key, owner);
                removed += 1;
            }
        }
        if removed != ref_count {
            debug!(
                "expected to remove {ref_count} flows for address set {} ip {:#x}, removed {removed}",
                as_info.name, as_info.ip
            );
            return false;
        }
        true
    }

    fn flood_remove_flows(&mut self, owners: &mut BTreeSet<Uuid>) {
        let mut todo: Vec<Uuid> = owners.iter().copied().collect();
        while let Some(owner) = todo.pop() {
            let keys: Vec<FlowKey> = self
                .by_owner
                .get(&owner)
                .map(|ks| ks.iter().cloned().collect())
                .unwrap_or_default();
            for key in keys {
                // Any other row that contributed to this flow has lost
                // output and must be recompiled as well.
                let co_owners: Vec<Uuid> = self
                    .flows
                    .get(&key)
                    .map(|e| e.owners.keys().copied().collect())
                    .unwrap_or_default();
                for co in co_owners {
                    if co != owner && owners.insert(co) {
                        todo.push(co);
                    }
                    self.remove_key_owner(&key, &co);
                }
            }
        }
    }
}
