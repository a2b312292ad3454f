// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The translation engine: full runs and the incremental protocols.
//!
//! All state is owned here and mutated only by the caller's thread. One
//! tick is: clear the processed set, drain tracked changes through the
//! `handle_*` entries, and fall back to a full recompute (fresh engine,
//! fresh sink) if any handler declines.

use crate::compile::{is_chassis_resident, lookup_port, mg_key, ActionEnv};
use crate::cache::LflowCache;
use crate::conj_ids::ConjIdAllocator;
use crate::extend_table::ExtendTable;
use crate::hairpin;
use crate::idpool::IdPool;
use crate::neighbors;
use crate::portsec;
use crate::refs::{RefTracker, RefType};
use crate::view::{ChassisCtx, DatapathRow, LogicalFlowRow, PortBindingRow, SbView};
use actions::parse_actions;
use ahash::RandomState;
use expr::{evaluate_condition, matches_prepare, normalize, parse_match, simplify, to_matches,
           AddrSets, Condition, Const, ConstSet, Expr, ExprMatch};
use oflow::table::LOG_PIPELINE_LEN;
use oflow::{AsInfo, FlowSink};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;

/// Bounded id space for controller meters.
const METER_TABLE_CAPACITY: u32 = 65535;

/// What changed in an address set, relative to its current (new) value.
#[derive(Debug, Clone, Default)]
pub struct AddrSetDiff {
    pub added: Option<ConstSet>,
    pub deleted: Option<ConstSet>,
}

/// The logical-to-physical flow translation engine for one chassis.
pub struct LflowEngine {
    pub(crate) symtab: expr::Symtab,
    pub(crate) refs: RefTracker,
    pub(crate) conj_ids: ConjIdAllocator,
    pub(crate) cache: LflowCache,
    pub(crate) processed: BTreeSet<Uuid>,
    pub(crate) meter_table: ExtendTable,
    hairpin_ids: HashMap<String, u32, RandomState>,
    hairpin_id_pool: IdPool,
}

impl LflowEngine {
    /// An engine with the given compilation cache budget (0 disables
    /// the cache).
    #[must_use]
    pub fn new(cache_budget_bytes: usize) -> Self {
        Self {
            symtab: expr::Symtab::new(),
            refs: RefTracker::new(),
            conj_ids: ConjIdAllocator::new(),
            cache: LflowCache::new(cache_budget_bytes),
            processed: BTreeSet::new(),
            meter_table: ExtendTable::new(METER_TABLE_CAPACITY),
            hairpin_ids: HashMap::with_hasher(RandomState::with_seed(0)),
            hairpin_id_pool: IdPool::new(1, u32::MAX - 1),
        }
    }

    /// The reference tracker, for inspection.
    #[must_use]
    pub fn refs(&self) -> &RefTracker {
        &self.refs
    }

    /// The conjunction id allocator, for inspection.
    #[must_use]
    pub fn conj_ids(&self) -> &ConjIdAllocator {
        &self.conj_ids
    }

    /// Cache hit/miss counters.
    #[must_use]
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Forget which flows were handled this tick. Call once per tick
    /// before draining tracked changes.
    pub fn clear_processed(&mut self) {
        self.processed.clear();
    }

    fn ensure_hairpin_id(&mut self, name: &str) -> u32 {
        if let Some(id) = self.hairpin_ids.get(name) {
            return *id;
        }
        // Running out means four billion live load balancers; there is
        // no reasonable way to continue from that.
        let id = self
            .hairpin_id_pool
            .alloc()
            .unwrap_or_else(|| panic!("hairpin load balancer ids exhausted"));
        self.hairpin_ids.insert(name.to_string(), id);
        id
    }

    fn drop_hairpin_id(&mut self, name: &str) {
        if let Some(id) = self.hairpin_ids.remove(name) {
            self.hairpin_id_pool.free(id);
        }
    }

    /// Full translation of the view into the sink: logical flows,
    /// neighbor flows, load-balancer hairpin flows, FDB flows and
    /// port-security flows.
    pub fn run<S: FlowSink>(&mut self, view: &SbView, ctx: &ChassisCtx, sink: &mut S) {
        let env = ActionEnv::build(view);
        for lflow in view.logical_flows.iter() {
            self.consider_logical_flow(lflow, true, &env, view, ctx, sink);
        }

        neighbors::add_neighbor_flows(view, ctx, sink);

        for lb in view.load_balancers.iter() {
            let id = self.ensure_hairpin_id(&lb.name);
            hairpin::consider_lb_hairpin_flows(lb, id, view, ctx, sink);
        }

        neighbors::add_fdb_flows(view, ctx, sink);

        for pb in view.port_bindings.iter() {
            if pb.chassis.as_deref() == Some(ctx.chassis.as_str())
                && !pb.port_security.is_empty()
            {
                portsec::consider_port_sec_flows(pb, view, ctx, sink);
            }
        }
    }

    /// Incremental handling of tracked logical-flow rows: flood remove,
    /// then recompile the rows that still exist.
    pub fn handle_changed_flows<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        let env = ActionEnv::build(view);
        let mut flood: BTreeSet<Uuid> = BTreeSet::new();
        for t in view.logical_flows.tracked() {
            if self.processed.contains(&t.row.uuid) {
                debug!("lflow {} has been processed, skip", t.row.uuid);
                continue;
            }
            debug!("delete lflow {}", t.row.uuid);
            flood.insert(t.row.uuid);
            if !t.is_new() {
                self.cache.delete(&t.row.uuid);
            }
        }
        sink.flood_remove_flows(&mut flood);
        for uuid in flood {
            self.refs.remove_all_for_flow(&uuid);
            self.conj_ids.free_for_flow(&uuid);
            let Some(lflow) = view.logical_flows.get(&uuid) else {
                continue;
            };
            debug!("re-add lflow {uuid}");
            // Flows dragged in by the flood remove may have been
            // processed earlier in the tick; they need a second pass
            // now that their output is gone.
            self.processed.remove(&uuid);
            self.consider_logical_flow(lflow, false, &env, view, ctx, sink);
        }
        true
    }

    /// A symbol (address set, port group, port binding, multicast
    /// group) changed: flood-remove and recompile every referrer.
    pub fn handle_changed_ref<S: FlowSink>(
        &mut self,
        ref_type: RefType,
        name: &str,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        let todo: Vec<Uuid> = self
            .refs
            .lookup_by_symbol(ref_type, name)
            .into_iter()
            .map(|(uuid, _)| uuid)
            .filter(|uuid| !self.processed.contains(uuid))
            .collect();
        if todo.is_empty() {
            return true;
        }
        debug!("handle changed lflow reference {ref_type:?} {name}");

        let env = ActionEnv::build(view);
        let mut flood: BTreeSet<Uuid> = todo.into_iter().collect();
        sink.flood_remove_flows(&mut flood);
        for uuid in flood {
            self.refs.remove_all_for_flow(&uuid);
            self.conj_ids.free_for_flow(&uuid);
            let Some(lflow) = view.logical_flows.get(&uuid) else {
                debug!("lflow {uuid} not found while reprocessing {name}");
                continue;
            };
            self.processed.remove(&uuid);
            self.consider_logical_flow(lflow, false, &env, view, ctx, sink);
        }
        true
    }

    /// The delta gate: a change can be applied in place only when both
    /// the old and new set sizes keep the compiled template and the
    /// diff is smaller than a recompilation.
    fn as_update_can_be_handled(&self, name: &str, diff: &AddrSetDiff, ctx: &ChassisCtx) -> bool {
        let Some(current) = ctx.addr_sets.get(name) else {
            return false;
        };
        let n_added = diff.added.as_ref().map_or(0, ConstSet::len);
        let n_deleted = diff.deleted.as_ref().map_or(0, ConstSet::len);
        let new_size = current.len();
        let old_size = new_size + n_deleted - n_added;
        if old_size <= 1 || new_size <= 1 {
            return false;
        }
        if n_added + n_deleted >= new_size {
            return false;
        }
        true
    }

    /// Handle an address-set update incrementally, touching only the
    /// added and deleted addresses. Returns false when the update
    /// cannot be applied this way and the caller must reprocess the
    /// referrers (or recompute).
    pub fn handle_addr_set_update<S: FlowSink>(
        &mut self,
        name: &str,
        diff: &AddrSetDiff,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        debug_assert!(diff.added.is_some() || diff.deleted.is_some());
        if !self.as_update_can_be_handled(name, diff, ctx) {
            return false;
        }
        let referrers = self.refs.lookup_by_symbol(RefType::AddrSet, name);
        if referrers.is_empty() {
            return true;
        }

        let env = ActionEnv::build(view);
        for (uuid, ref_count) in referrers {
            if self.processed.contains(&uuid) {
                debug!("lflow {uuid} has been processed, skip");
                continue;
            }
            let Some(lflow) = view.logical_flows.get(&uuid) else {
                // Deletion of the flow itself is the flow handler's
                // business.
                debug!("lflow {uuid} not found while handling update of address set {name}");
                continue;
            };

            if let Some(deleted) = &diff.deleted {
                for c in &deleted.0 {
                    let Some(mask) = c.as_tag_mask() else {
                        continue;
                    };
                    let as_info = AsInfo {
                        name: name.to_string(),
                        ip: c.value,
                        mask,
                    };
                    if !sink.remove_flows_for_as_ip(&uuid, &as_info, ref_count) {
                        return false;
                    }
                }
            }

            if let Some(added) = &diff.added {
                if !self.consider_lflow_for_added_as_ips(
                    lflow, name, ref_count, added, &env, view, ctx, sink,
                ) {
                    return false;
                }
            }
        }
        true
    }

    /// Compile just the new addresses of an address set for one flow,
    /// against a stand-in set containing only the additions.
    #[allow(clippy::too_many_arguments)]
    fn consider_lflow_for_added_as_ips<S: FlowSink>(
        &mut self,
        lflow: &LogicalFlowRow,
        as_name: &str,
        as_ref_count: usize,
        added: &ConstSet,
        env: &ActionEnv,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        if lflow.logical_datapath.is_none() && lflow.logical_dp_group.is_none() {
            debug!("lflow {} has no datapath binding, skip", lflow.uuid);
            return true;
        }
        if let Some(dp_uuid) = lflow.logical_datapath {
            let Some(dp) = view.datapaths.get(&dp_uuid) else {
                return true;
            };
            return self.consider_lflow_for_added_as_ips_on_dp(
                lflow, dp, as_name, as_ref_count, added, env, view, ctx, sink,
            );
        }
        let Some(group_uuid) = lflow.logical_dp_group else {
            return true;
        };
        let Some(group) = view.dp_groups.get(&group_uuid) else {
            return true;
        };
        for dp_uuid in group.datapaths.clone() {
            let Some(dp) = view.datapaths.get(&dp_uuid) else {
                continue;
            };
            if !self.consider_lflow_for_added_as_ips_on_dp(
                lflow, dp, as_name, as_ref_count, added, env, view, ctx, sink,
            ) {
                return false;
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn consider_lflow_for_added_as_ips_on_dp<S: FlowSink>(
        &mut self,
        lflow: &LogicalFlowRow,
        dp: &DatapathRow,
        as_name: &str,
        as_ref_count: usize,
        added: &ConstSet,
        env: &ActionEnv,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        let Some(ldp) = ctx.local_datapath(dp.tunnel_key) else {
            debug!(
                "skip lflow {} for non-local datapath {}",
                lflow.uuid, dp.tunnel_key
            );
            return true;
        };
        debug_assert!(!added.is_empty());

        let ptable = lflow.pipeline.first_ptable(&ctx.tables) + lflow.table_id;
        let pp = actions::ParseParams {
            symtab: &self.symtab,
            dhcp_opts: &env.dhcp_opts,
            dhcpv6_opts: &env.dhcpv6_opts,
            pipeline: lflow.pipeline,
            n_tables: LOG_PIPELINE_LEN,
            cur_ltable: lflow.table_id,
        };
        let parsed_actions = match parse_actions(&lflow.actions, &pp) {
            Ok(p) => p,
            Err(e) => {
                warn!("error parsing actions \"{}\": {e}", lflow.actions);
                return true;
            }
        };

        // With a single added address the stand-in is padded to two
        // members with a distinguishable dummy, so that parsing takes
        // the same shape (sets, conjunctions) it would with the full
        // address set.
        let mut fake = added.clone();
        let mut dummy_ip = None;
        if fake.len() == 1 {
            let mut dummy: Const = fake.0[0];
            let width_mask = match dummy.format_bits() {
                Some(128) | None => u128::MAX,
                Some(bits) => (1u128 << bits) - 1,
            };
            dummy.value = dummy.value.wrapping_add(1) & width_mask;
            dummy_ip = Some(dummy.value);
            fake.0.push(dummy);
        }

        let addr_sets = AddrSets::with_overlay(&ctx.addr_sets, as_name, &fake);
        let pr = parse_match(&lflow.match_expr, &self.symtab, &addr_sets, &ctx.port_groups);
        for (name, count) in &pr.addr_sets_ref {
            self.refs.add(RefType::AddrSet, name, lflow.uuid, *count);
        }
        for name in &pr.port_groups_ref {
            self.refs.add(RefType::PortGroup, name, lflow.uuid, 0);
        }
        let expr = match pr.result {
            Ok(e) => e,
            Err(err) => {
                warn!("error parsing match \"{}\": {err}", lflow.match_expr);
                return true;
            }
        };
        let combined = match parsed_actions.prereqs.clone() {
            Some(prereqs) => Expr::And(vec![expr, prereqs]),
            None => expr,
        };
        let evaluated = {
            let refs = &mut self.refs;
            evaluate_condition(simplify(combined), &mut |cond| {
                let Condition::ChassisResident(port) = cond;
                is_chassis_resident(refs, view, ctx, &lflow.uuid, port)
            })
        };
        let normalized = normalize(evaluated);
        let (matches, n_conjs) = {
            let refs = &mut self.refs;
            to_matches(&normalized, &mut |name| {
                lookup_port(refs, view, dp, &lflow.uuid, name)
            })
        };
        if matches.is_empty() {
            debug!("lflow {} matches are empty, skip", lflow.uuid);
            return true;
        }

        // Keep only the matches produced by the added addresses.
        let mut kept: Vec<ExprMatch> = matches
            .into_iter()
            .filter(|m| {
                let Some(info) = &m.as_info else {
                    return false;
                };
                if info.name != as_name {
                    return false;
                }
                dummy_ip != Some(info.ip)
            })
            .collect();

        // The added addresses must account for exactly ref_count flows
        // each; anything else means the set's structure in this match
        // is too entangled for the delta path.
        if kept.len() != as_ref_count * added.len() {
            debug!(
                "lflow {}, addrset {as_name}: generated {} flows, expected {} x {}, \
                 need reprocessing",
                lflow.uuid,
                kept.len(),
                as_ref_count,
                added.len()
            );
            return false;
        }
        if n_conjs > 0 {
            let Some(start) = self.conj_ids.find(&lflow.uuid, &dp.uuid) else {
                debug!("lflow {} didn't have conjunctions, need reprocessing", lflow.uuid);
                return false;
            };
            matches_prepare(&mut kept, start - 1);
        }
        self.add_matches_to_flow_table(lflow, dp, ldp, &kept, ptable, &parsed_actions, view,
                                       ctx, sink);
        true
    }

    /// Tracked port-binding rows: insertions and deletions reprocess
    /// the flows that referenced the port by name.
    pub fn handle_changed_port_bindings<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        let names: Vec<String> = view
            .port_bindings
            .tracked()
            .iter()
            .filter(|t| t.is_new() || t.is_deleted())
            .map(|t| t.row.logical_port.clone())
            .collect();
        for name in names {
            if !self.handle_changed_ref(RefType::PortBinding, &name, view, ctx, sink) {
                return false;
            }
        }
        true
    }

    /// Tracked multicast-group rows, keyed by `(datapath key, name)`.
    pub fn handle_changed_mc_groups<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        let mut keys = Vec::new();
        for t in view.multicast_groups.tracked() {
            if !t.is_new() && !t.is_deleted() {
                continue;
            }
            let Some(dp) = view.datapaths.get(&t.row.datapath) else {
                continue;
            };
            keys.push(mg_key(dp.tunnel_key, &t.row.name));
        }
        for key in keys {
            if !self.handle_changed_ref(RefType::McastGroup, &key, view, ctx, sink) {
                return false;
            }
        }
        true
    }

    /// A port's residency on this chassis changed: reprocess referrers
    /// and regenerate its port-security pipeline.
    pub fn handle_flows_for_lport<S: FlowSink>(
        &mut self,
        pb: &PortBindingRow,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        if !self.handle_changed_ref(RefType::PortBinding, &pb.logical_port, view, ctx, sink) {
            return false;
        }
        // All flows keyed by the binding's own uuid are port-security
        // flows today; regenerate them from scratch.
        sink.remove_flows(&pb.uuid);
        if !pb.port_security.is_empty() && pb.chassis.as_deref() == Some(ctx.chassis.as_str()) {
            portsec::consider_port_sec_flows(pb, view, ctx, sink);
        }
        true
    }

    /// A datapath became local: compile everything scoped to it.
    pub fn add_flows_for_datapath<S: FlowSink>(
        &mut self,
        dp: &DatapathRow,
        dp_lbs: &[Uuid],
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        let env = ActionEnv::build(view);

        let direct: Vec<LogicalFlowRow> = view
            .lflows_by_datapath(&dp.uuid)
            .into_iter()
            .cloned()
            .collect();
        for lflow in &direct {
            if self.processed.contains(&lflow.uuid) {
                continue;
            }
            self.processed.insert(lflow.uuid);
            self.consider_logical_flow_on_dp(lflow, dp, &env, view, ctx, sink);
        }

        let groups: Vec<Uuid> = view
            .dp_groups
            .iter()
            .filter(|g| g.datapaths.contains(&dp.uuid))
            .map(|g| g.uuid)
            .collect();
        for group in groups {
            let grouped: Vec<LogicalFlowRow> = view
                .lflows_by_dp_group(&group)
                .into_iter()
                .cloned()
                .collect();
            for lflow in &grouped {
                if self.processed.contains(&lflow.uuid) {
                    continue;
                }
                // Not marked processed: only one datapath of the group
                // was compiled here, the rest still needs a full pass.
                self.consider_logical_flow_on_dp(lflow, dp, &env, view, ctx, sink);
            }
        }

        for fdb in view.fdbs_by_dp_key(dp.tunnel_key) {
            neighbors::consider_fdb_flows(fdb, ctx, sink);
        }
        for mb in view.mac_bindings_by_datapath(&dp.uuid) {
            neighbors::consider_neighbor_flow(
                &neighbors::NeighborSource {
                    uuid: mb.uuid,
                    logical_port: &mb.logical_port,
                    ip: &mb.ip,
                    mac: &mb.mac,
                    priority: 100,
                },
                view,
                ctx,
                sink,
            );
        }
        for smb in view.static_mac_bindings_by_datapath(&dp.uuid) {
            neighbors::consider_neighbor_flow(
                &neighbors::NeighborSource {
                    uuid: smb.uuid,
                    logical_port: &smb.logical_port,
                    ip: &smb.ip,
                    mac: &smb.mac,
                    priority: neighbors::static_mac_priority(smb.override_dynamic_mac),
                },
                view,
                ctx,
                sink,
            );
        }

        for lb_uuid in dp_lbs {
            let Some(lb) = view.load_balancers.get(lb_uuid) else {
                continue;
            };
            let name = lb.name.clone();
            let lb = lb.clone();
            let id = self.ensure_hairpin_id(&name);
            hairpin::consider_lb_hairpin_flows(&lb, id, view, ctx, sink);
        }
        true
    }

    /// Tracked load-balancer rows: deletions first, then updates and
    /// insertions regenerate hairpin flows.
    pub fn handle_changed_lbs<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        for t in view.load_balancers.tracked() {
            if t.is_deleted() {
                debug!("remove hairpin flows for deleted load balancer {}", t.row.uuid);
                sink.remove_flows(&t.row.uuid);
                self.drop_hairpin_id(&t.row.name);
            }
        }
        let todo: Vec<(Uuid, String, bool)> = view
            .load_balancers
            .tracked()
            .iter()
            .filter(|t| !t.is_deleted())
            .map(|t| (t.row.uuid, t.row.name.clone(), t.is_new()))
            .collect();
        for (uuid, name, is_new) in todo {
            if !is_new {
                debug!("remove hairpin flows for updated load balancer {uuid}");
                sink.remove_flows(&uuid);
            }
            let id = self.ensure_hairpin_id(&name);
            let Some(lb) = view.load_balancers.get(&uuid) else {
                continue;
            };
            debug!("add load balancer hairpin flows for {uuid}");
            hairpin::consider_lb_hairpin_flows(lb, id, view, ctx, sink);
        }
        true
    }

    /// Tracked FDB rows: deletions first, then regenerate.
    pub fn handle_changed_fdbs<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        for t in view.fdbs.tracked() {
            if t.is_deleted() {
                debug!("remove fdb flows for deleted fdb {}", t.row.uuid);
                sink.remove_flows(&t.row.uuid);
            }
        }
        for t in view.fdbs.tracked() {
            if t.is_deleted() {
                continue;
            }
            if !t.is_new() {
                sink.remove_flows(&t.row.uuid);
            }
            if let Some(fdb) = view.fdbs.get(&t.row.uuid) {
                neighbors::consider_fdb_flows(fdb, ctx, sink);
            }
        }
        true
    }

    /// Tracked MAC-binding rows: deletions first to avoid re-adding a
    /// duplicate of a flow that moves between rows.
    pub fn handle_changed_mac_bindings<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        for t in view.mac_bindings.tracked() {
            if t.is_deleted() {
                sink.remove_flows(&t.row.uuid);
            }
        }
        for t in view.mac_bindings.tracked() {
            if t.is_deleted() {
                continue;
            }
            if !t.is_new() {
                sink.remove_flows(&t.row.uuid);
            }
            if let Some(mb) = view.mac_bindings.get(&t.row.uuid) {
                neighbors::consider_neighbor_flow(
                    &neighbors::NeighborSource {
                        uuid: mb.uuid,
                        logical_port: &mb.logical_port,
                        ip: &mb.ip,
                        mac: &mb.mac,
                        priority: 100,
                    },
                    view,
                    ctx,
                    sink,
                );
            }
        }
        true
    }

    /// Tracked static MAC-binding rows.
    pub fn handle_changed_static_mac_bindings<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        for t in view.static_mac_bindings.tracked() {
            if t.is_deleted() {
                sink.remove_flows(&t.row.uuid);
            }
        }
        for t in view.static_mac_bindings.tracked() {
            if t.is_deleted() {
                continue;
            }
            if !t.is_new() {
                sink.remove_flows(&t.row.uuid);
            }
            if let Some(smb) = view.static_mac_bindings.get(&t.row.uuid) {
                neighbors::consider_neighbor_flow(
                    &neighbors::NeighborSource {
                        uuid: smb.uuid,
                        logical_port: &smb.logical_port,
                        ip: &smb.ip,
                        mac: &smb.mac,
                        priority: neighbors::static_mac_priority(smb.override_dynamic_mac),
                    },
                    view,
                    ctx,
                    sink,
                );
            }
        }
        true
    }

    /// Drain every tracked table in one tick, in deterministic order.
    /// Returns false when the caller should fall back to a full
    /// recompute.
    pub fn handle_tracked_changes<S: FlowSink>(
        &mut self,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) -> bool {
        let mut ok = true;
        ok &= self.handle_changed_flows(view, ctx, sink);
        ok &= self.handle_changed_port_bindings(view, ctx, sink);
        ok &= self.handle_changed_mc_groups(view, ctx, sink);
        ok &= self.handle_changed_lbs(view, ctx, sink);
        ok &= self.handle_changed_fdbs(view, ctx, sink);
        ok &= self.handle_changed_mac_bindings(view, ctx, sink);
        ok &= self.handle_changed_static_mac_bindings(view, ctx, sink);
        ok
    }
}
