// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-flow compilation: parse, evaluate, normalize, generate matches
//! and emit, with cache integration.

use crate::engine::LflowEngine;
use crate::cache::CacheValue;
use crate::refs::{RefTracker, RefType};
use crate::view::{ChassisCtx, DatapathRow, LocalDatapath, LogicalFlowRow, SbView};
use actions::{encode, parse_actions, DhcpOptsMap, EncodeParams, ParseParams, ParsedActions};
use ahash::RandomState;
use expr::{evaluate_condition, matches_prepare, normalize, parse_match, simplify, to_matches,
           AddrSets, Condition, Expr, ExprMatch};
use oflow::table::LOG_PIPELINE_LEN;
use oflow::{FlowSink, Mff, OfAction, Pipeline};
use tracing::{debug, warn};
use uuid::Uuid;

/// DHCP option maps assembled from the view once per engine entry point.
pub(crate) struct ActionEnv {
    pub dhcp_opts: DhcpOptsMap,
    pub dhcpv6_opts: DhcpOptsMap,
}

impl ActionEnv {
    pub(crate) fn build(view: &SbView) -> Self {
        let mut dhcp_opts = DhcpOptsMap::with_hasher(RandomState::with_seed(0));
        for row in view.dhcp_options.iter() {
            dhcp_opts.insert(row.name.clone(), row.code);
        }
        let mut dhcpv6_opts = DhcpOptsMap::with_hasher(RandomState::with_seed(0));
        for row in view.dhcpv6_options.iter() {
            dhcpv6_opts.insert(row.name.clone(), row.code);
        }
        Self {
            dhcp_opts,
            dhcpv6_opts,
        }
    }
}

/// The multicast-group reference key: groups are scoped per datapath.
pub(crate) fn mg_key(dp_key: u64, name: &str) -> String {
    format!("{dp_key}_{name}")
}

/// Resolve a port name to a port key on `dp`, recording the references
/// that make the result dependent on external rows.
pub(crate) fn lookup_port(
    refs: &mut RefTracker,
    view: &SbView,
    dp: &DatapathRow,
    lflow: &Uuid,
    name: &str,
) -> Option<u64> {
    if name == "none" {
        return Some(0);
    }
    refs.add(RefType::PortBinding, name, *lflow, 0);
    if let Some(pb) = view.pb_by_name(name) {
        if pb.datapath == dp.uuid {
            return Some(pb.tunnel_key);
        }
    }
    let key = mg_key(dp.tunnel_key, name);
    refs.add(RefType::McastGroup, &key, *lflow, 0);
    view.mg_by_name_dp(name, &dp.uuid).map(|mg| mg.tunnel_key)
}

/// The chassis-residency predicate, recording the port-binding
/// reference first so a later binding change reprocesses the flow.
pub(crate) fn is_chassis_resident(
    refs: &mut RefTracker,
    view: &SbView,
    ctx: &ChassisCtx,
    lflow: &Uuid,
    port_name: &str,
) -> bool {
    refs.add(RefType::PortBinding, port_name, *lflow, 0);
    let Some(pb) = view.pb_by_name(port_name) else {
        return false;
    };
    if pb.ptype != "chassisredirect" {
        return pb.chassis.as_deref() == Some(ctx.chassis.as_str());
    }
    let Some(group) = &pb.ha_chassis_group else {
        return false;
    };
    if !group.contains(&ctx.chassis) {
        return false;
    }
    group.active_chassis(&ctx.active_tunnels, &ctx.chassis) == Some(ctx.chassis.as_str())
}

enum Cached {
    None,
    Expr(Expr),
    Matches(Vec<ExprMatch>, u32, u32),
}

impl LflowEngine {
    /// Compile one logical flow on every datapath it is scoped to.
    pub(crate) fn consider_logical_flow<S: FlowSink>(
        &mut self,
        lflow: &LogicalFlowRow,
        is_recompute: bool,
        env: &ActionEnv,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) {
        if lflow.logical_datapath.is_none() && lflow.logical_dp_group.is_none() {
            debug!("lflow {} has no datapath binding, skip", lflow.uuid);
            return;
        }
        debug_assert!(
            lflow.logical_datapath.is_some() != lflow.logical_dp_group.is_some(),
            "datapath XOR datapath group"
        );
        if !is_recompute {
            debug_assert!(!self.processed.contains(&lflow.uuid));
            self.processed.insert(lflow.uuid);
        }
        if let Some(dp_uuid) = lflow.logical_datapath {
            if let Some(dp) = view.datapaths.get(&dp_uuid) {
                self.consider_logical_flow_on_dp(lflow, dp, env, view, ctx, sink);
            }
            return;
        }
        let Some(group_uuid) = lflow.logical_dp_group else {
            return;
        };
        let Some(group) = view.dp_groups.get(&group_uuid) else {
            return;
        };
        for dp_uuid in &group.datapaths {
            if let Some(dp) = view.datapaths.get(dp_uuid) {
                self.consider_logical_flow_on_dp(lflow, dp, env, view, ctx, sink);
            }
        }
    }

    /// Compile one logical flow for one concrete datapath.
    pub(crate) fn consider_logical_flow_on_dp<S: FlowSink>(
        &mut self,
        lflow: &LogicalFlowRow,
        dp: &DatapathRow,
        env: &ActionEnv,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) {
        let Some(ldp) = ctx.local_datapath(dp.tunnel_key) else {
            debug!(
                "skip lflow {} for non-local datapath {}",
                lflow.uuid, dp.tunnel_key
            );
            return;
        };

        if let Some(io_port) = lflow.in_out_port() {
            self.refs.add(RefType::PortBinding, io_port, lflow.uuid, 0);
            let Some(pb) = view.pb_by_name(io_port) else {
                debug!(
                    "lflow {} matches inport/outport {io_port} that's not found, skip",
                    lflow.uuid
                );
                return;
            };
            if !ctx.lport_is_related(dp.tunnel_key, pb.tunnel_key) {
                debug!(
                    "lflow {} matches inport/outport {io_port} that's not local, skip",
                    lflow.uuid
                );
                return;
            }
        }

        let ptable = lflow.pipeline.first_ptable(&ctx.tables) + lflow.table_id;

        let pp = ParseParams {
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
                return;
            }
        };

        let mut cached = match self.cache.get(&lflow.uuid) {
            Some(CacheValue::Expr { expr, .. }) => Cached::Expr(expr.clone()),
            Some(CacheValue::Matches {
                matches,
                conj_id_ofs,
                n_conjs,
                ..
            }) => Cached::Matches(matches.clone(), *conj_id_ofs, *n_conjs),
            None => Cached::None,
        };

        // A cached match set numbered against a conjunction range is
        // only valid if the allocator still grants that range.
        if let Cached::Matches(_, ofs, n) = &cached {
            if *n > 0 && !self.conj_ids.alloc_specified(lflow.uuid, dp.uuid, *ofs, *n) {
                debug!(
                    "lflow {} cached with conjunctions but ids are gone, dropping cache",
                    lflow.uuid
                );
                self.cache.delete(&lflow.uuid);
                cached = Cached::None;
            }
        }

        let was_none = matches!(cached, Cached::None);
        let mut pg_addr_set_ref = false;

        let expr = match &cached {
            Cached::Matches(..) => None,
            Cached::Expr(e) => Some(e.clone()),
            Cached::None => {
                let addr_sets = AddrSets::new(&ctx.addr_sets);
                let pr = parse_match(&lflow.match_expr, &self.symtab, &addr_sets, &ctx.port_groups);
                for (name, count) in &pr.addr_sets_ref {
                    self.refs.add(RefType::AddrSet, name, lflow.uuid, *count);
                }
                for name in &pr.port_groups_ref {
                    self.refs.add(RefType::PortGroup, name, lflow.uuid, 0);
                }
                pg_addr_set_ref =
                    !pr.addr_sets_ref.is_empty() || !pr.port_groups_ref.is_empty();
                let e = match pr.result {
                    Ok(e) => e,
                    Err(err) => {
                        warn!("error parsing match \"{}\": {err}", lflow.match_expr);
                        return;
                    }
                };
                let combined = match parsed_actions.prereqs.clone() {
                    Some(prereqs) => Expr::And(vec![e, prereqs]),
                    None => e,
                };
                Some(simplify(combined))
            }
        };

        // Save the chassis-independent tree for caching before the
        // chassis-dependent stages run.
        let cached_expr = if was_none && self.cache.is_enabled() && !pg_addr_set_ref {
            expr.clone()
        } else {
            None
        };

        let (matches, start_conj_id, n_conjs) = match cached {
            Cached::Matches(m, ofs, n) => (m, ofs, n),
            _ => {
                let Some(expr) = expr else {
                    return;
                };
                let evaluated = {
                    let refs = &mut self.refs;
                    evaluate_condition(expr, &mut |cond| {
                        let Condition::ChassisResident(port) = cond;
                        is_chassis_resident(refs, view, ctx, &lflow.uuid, port)
                    })
                };
                let normalized = normalize(evaluated);
                let (mut matches, n_conjs) = {
                    let refs = &mut self.refs;
                    to_matches(&normalized, &mut |name| {
                        lookup_port(refs, view, dp, &lflow.uuid, name)
                    })
                };
                if matches.is_empty() {
                    debug!("lflow {} matches are empty, skip", lflow.uuid);
                    return;
                }
                let mut start = 0;
                if n_conjs > 0 {
                    start = self.conj_ids.alloc(lflow.uuid, dp.uuid, n_conjs);
                    matches_prepare(&mut matches, start - 1);
                }
                (matches, start, n_conjs)
            }
        };

        self.add_matches_to_flow_table(lflow, dp, ldp, &matches, ptable, &parsed_actions, view,
                                       ctx, sink);

        if was_none && self.cache.is_enabled() {
            if cached_expr.is_some() && !self.refs.flow_has_refs(&lflow.uuid) {
                self.cache
                    .add_matches(lflow.uuid, matches, start_conj_id, n_conjs);
            } else if let Some(ce) = cached_expr {
                self.cache.add_expr(lflow.uuid, ce);
            }
        }
    }

    /// Localize the generated matches to the datapath and hand them to
    /// the sink.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_matches_to_flow_table<S: FlowSink>(
        &mut self,
        lflow: &LogicalFlowRow,
        dp: &DatapathRow,
        ldp: &LocalDatapath,
        matches: &[ExprMatch],
        ptable: u8,
        parsed_actions: &ParsedActions,
        view: &SbView,
        ctx: &ChassisCtx,
        sink: &mut S,
    ) {
        let ctrl_meter_id = match &lflow.controller_meter {
            Some(name) => {
                let id = self.meter_table.assign_id(name, lflow.uuid);
                if id.is_none() {
                    warn!("unable to assign id for meter: {name}");
                }
                id
            }
            None => None,
        };

        let common_nat_ct_zone = if ldp.external_ids.contains_key("snat-ct-zone") {
            Mff::LOG_SNAT_ZONE
        } else {
            Mff::LOG_DNAT_ZONE
        };
        let ep = EncodeParams {
            tables: &ctx.tables,
            pipeline: lflow.pipeline,
            cur_ltable: lflow.table_id,
            ctrl_meter_id,
            common_nat_ct_zone,
        };
        let ofpacts = {
            let refs = &mut self.refs;
            encode(&parsed_actions.actions, &ep, &mut |name| {
                lookup_port(refs, view, dp, &lflow.uuid, name)
            })
        };

        let ingress = lflow.pipeline == Pipeline::Ingress;
        for m in matches {
            let mut fmatch = m.fmatch.clone();
            fmatch.set_metadata(ldp.tunnel_key);
            if ldp.is_switch {
                // Matches pinned to a specific inport (ingress) or
                // outport (egress) only matter if that lport is local.
                let reg = if ingress { Mff::LOG_INPORT } else { Mff::LOG_OUTPORT };
                if let Some(mv) = fmatch.get(reg) {
                    let port_id = mv.value as u64;
                    if port_id != 0 && !ctx.lport_is_related(ldp.tunnel_key, port_id) {
                        debug!(
                            "lflow {} port {port_id} in match is not local, skip",
                            lflow.uuid
                        );
                        continue;
                    }
                }
            }
            if m.conjunctions.is_empty() {
                sink.add_flow_metered(
                    ptable,
                    lflow.priority,
                    fmatch,
                    ofpacts.clone(),
                    ctrl_meter_id,
                    lflow.uuid,
                    m.as_info.clone(),
                );
            } else {
                debug_assert!(m.conjunctions.len() == 1 || m.as_info.is_none());
                let conj_actions: Vec<OfAction> = m
                    .conjunctions
                    .iter()
                    .map(|c| OfAction::Conjunction {
                        id: c.id,
                        clause: c.clause,
                        n_clauses: c.n_clauses,
                    })
                    .collect();
                sink.add_or_append_flow(
                    ptable,
                    lflow.priority,
                    fmatch,
                    conj_actions,
                    ctrl_meter_id,
                    lflow.uuid,
                    m.as_info.clone(),
                );
            }
        }
    }
}
