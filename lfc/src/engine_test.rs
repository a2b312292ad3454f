// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end tests for the translation engine.

use crate::cache::CacheValue;
use crate::engine::{AddrSetDiff, LflowEngine};
use crate::refs::RefType;
use crate::view::{ChassisCtx, DatapathRow, DpGroupRow, FdbRow, HaChassisGroup, HaMember,
                  LbBackend, LbVip, LoadBalancerRow, LocalDatapath, LogicalFlowRow,
                  MacBindingRow, McastGroupRow, PortBindingRow, SbView};
use ahash::RandomState;
use expr::{Const, ConstFormat, ConstSet};
use oflow::{DesiredFlowTable, Mff, OfAction, Pipeline, TableMap};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use tracing_test::traced_test;
use uuid::Uuid;

const DP_KEY: u64 = 7;

fn uuid(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn v4(s: &str) -> Const {
    let addr: Ipv4Addr = s.parse().expect("bad test address");
    Const {
        value: u128::from(u32::from(addr)),
        mask: None,
        format: ConstFormat::Ipv4,
    }
}

fn empty_tags() -> HashMap<String, String, RandomState> {
    HashMap::with_hasher(RandomState::with_seed(0))
}

/// A view with one datapath (uuid 0x100, tunnel key 7) and a context
/// where that datapath is a local switch.
fn base_setup() -> (SbView, ChassisCtx) {
    let mut view = SbView::new();
    view.insert_datapath(DatapathRow {
        uuid: uuid(0x100),
        tunnel_key: DP_KEY,
        external_ids: empty_tags(),
    });
    let mut ctx = ChassisCtx::new("hv1");
    ctx.local_datapaths.insert(
        DP_KEY,
        LocalDatapath {
            datapath: uuid(0x100),
            tunnel_key: DP_KEY,
            is_switch: true,
            external_ids: empty_tags(),
        },
    );
    (view, ctx)
}

fn lflow(n: u128, table_id: u8, priority: u16, match_expr: &str, actions: &str)
    -> LogicalFlowRow {
    LogicalFlowRow {
        uuid: uuid(n),
        pipeline: Pipeline::Ingress,
        table_id,
        priority,
        match_expr: match_expr.to_string(),
        actions: actions.to_string(),
        logical_datapath: Some(uuid(0x100)),
        logical_dp_group: None,
        controller_meter: None,
        tags: empty_tags(),
    }
}

fn flows_in_table(sink: &DesiredFlowTable, table_id: u8) -> usize {
    sink.iter().filter(|f| f.table_id == table_id).count()
}

#[test]
fn exact_match_flow_is_translated() {
    let (mut view, ctx) = base_setup();
    view.insert_logical_flow(lflow(1, 3, 50, "ip4.dst == 10.0.0.1", "next;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);

    assert_eq!(sink.len(), 1);
    let tables = TableMap::default();
    let flow = sink.iter().next().expect("flow missing");
    assert_eq!(flow.table_id, tables.log_ingress_pipeline + 3);
    assert_eq!(flow.priority, 50);
    assert_eq!(flow.fmatch.get(Mff::Metadata).map(|v| v.value), Some(7));
    assert_eq!(flow.fmatch.get(Mff::EthType).map(|v| v.value), Some(0x800));
    assert_eq!(
        flow.fmatch.get(Mff::Ipv4Dst).map(|v| v.value),
        Some(0x0a000001)
    );
    assert_eq!(
        flow.actions,
        &[OfAction::Resubmit {
            table: tables.log_ingress_pipeline + 4
        }]
    );
    assert_eq!(flow.cookie, 1);
}

#[test]
fn address_set_disjunction_expands() {
    let (mut view, mut ctx) = base_setup();
    ctx.addr_sets.insert(
        "s".into(),
        ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2"), v4("3.3.3.3")]),
    );
    view.insert_logical_flow(lflow(1, 0, 10, "ip4.src == $s", "drop;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);

    assert_eq!(sink.len(), 3);
    for flow in sink.iter() {
        assert!(flow.actions.is_empty());
        let info = flow.owners[&uuid(1)].as_ref().expect("missing as tag");
        assert_eq!(info.name, "s");
        assert_eq!(info.mask, 0xffff_ffff);
    }
    assert_eq!(
        engine.refs().lookup_by_symbol(RefType::AddrSet, "s"),
        vec![(uuid(1), 1)]
    );
    // Flows with address-set references are never cached.
    assert!(engine.cache.is_empty());
}

#[test]
fn cross_set_cartesian_uses_a_conjunction() {
    let (mut view, mut ctx) = base_setup();
    ctx.addr_sets
        .insert("a".into(), ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2")]));
    ctx.addr_sets
        .insert("b".into(), ConstSet(vec![v4("3.3.3.3"), v4("4.4.4.4")]));
    view.insert_logical_flow(lflow(1, 0, 10, "ip4.src == $a && ip4.dst == $b", "drop;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);

    // Four clause flows plus the conj-id flow.
    assert_eq!(sink.len(), 5);
    let clause_flows: Vec<_> = sink
        .iter()
        .filter(|f| {
            f.actions
                .iter()
                .any(|a| matches!(a, OfAction::Conjunction { .. }))
        })
        .collect();
    assert_eq!(clause_flows.len(), 4);
    for f in &clause_flows {
        assert_eq!(
            f.actions,
            &[OfAction::Conjunction {
                id: 1,
                clause: if f.fmatch.get(Mff::Ipv4Src).is_some() { 0 } else { 1 },
                n_clauses: 2
            }]
        );
    }
    let conj_flow: Vec<_> = sink
        .iter()
        .filter(|f| f.fmatch.get(Mff::ConjId).is_some())
        .collect();
    assert_eq!(conj_flow.len(), 1);
    assert_eq!(engine.conj_ids().find(&uuid(1), &uuid(0x100)), Some(1));
}

#[test]
fn chassis_residency_gates_the_flow() {
    let (mut view, ctx) = base_setup();
    view.insert_logical_flow(lflow(1, 0, 10, "is_chassis_resident(\"p1\")", "next;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);

    assert!(sink.is_empty());
    assert_eq!(
        engine.refs().lookup_by_symbol(RefType::PortBinding, "p1"),
        vec![(uuid(1), 0)]
    );

    // The port appears on this chassis: the next tick emits the flow.
    view.clear_tracked();
    view.insert_port_binding(PortBindingRow {
        uuid: uuid(0x200),
        logical_port: "p1".into(),
        ptype: String::new(),
        datapath: uuid(0x100),
        tunnel_key: 5,
        chassis: Some("hv1".into()),
        ha_chassis_group: None,
        port_security: Vec::new(),
    });
    engine.clear_processed();
    assert!(engine.handle_changed_port_bindings(&view, &ctx, &mut sink));
    assert_eq!(sink.len(), 1);
    let flow = sink.iter().next().expect("flow missing");
    assert_eq!(flow.fmatch.get(Mff::Metadata).map(|v| v.value), Some(7));
}

#[test]
fn chassisredirect_residency_uses_ha_group() {
    let (mut view, mut ctx) = base_setup();
    ctx.active_tunnels.insert("hv2".into());
    view.insert_port_binding(PortBindingRow {
        uuid: uuid(0x200),
        logical_port: "cr-p1".into(),
        ptype: "chassisredirect".into(),
        datapath: uuid(0x100),
        tunnel_key: 5,
        chassis: Some("hv1".into()),
        ha_chassis_group: Some(HaChassisGroup {
            members: vec![
                HaMember { chassis: "hv1".into(), priority: 10 },
                HaMember { chassis: "hv2".into(), priority: 20 },
            ],
        }),
        port_security: Vec::new(),
    });
    view.insert_logical_flow(lflow(1, 0, 10, "is_chassis_resident(\"cr-p1\")", "next;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    // hv2 has higher priority and a live tunnel, so hv1 is standby.
    assert!(sink.is_empty());

    // With hv2's tunnel gone, hv1 becomes the active member.
    ctx.active_tunnels.clear();
    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert_eq!(sink.len(), 1);
}

#[test]
fn running_twice_is_idempotent() {
    let (mut view, mut ctx) = base_setup();
    ctx.addr_sets
        .insert("a".into(), ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2")]));
    ctx.addr_sets
        .insert("b".into(), ConstSet(vec![v4("3.3.3.3"), v4("4.4.4.4")]));
    view.insert_logical_flow(lflow(1, 3, 50, "ip4.dst == 10.0.0.1", "next;"));
    view.insert_logical_flow(lflow(2, 0, 10, "ip4.src == $a && ip4.dst == $b", "drop;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    let first = sink.snapshot();
    engine.run(&view, &ctx, &mut sink);
    assert_eq!(first, sink.snapshot());

    // A fresh engine over the same view produces the same table.
    let mut engine2 = LflowEngine::new(0);
    let mut sink2 = DesiredFlowTable::new();
    engine2.run(&view, &ctx, &mut sink2);
    assert_eq!(first, sink2.snapshot());
}

#[test]
fn incremental_changes_match_full_recompute() {
    let (mut view, mut ctx) = base_setup();
    ctx.addr_sets
        .insert("a".into(), ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2")]));
    ctx.addr_sets
        .insert("b".into(), ConstSet(vec![v4("3.3.3.3"), v4("4.4.4.4")]));
    view.insert_logical_flow(lflow(1, 3, 50, "ip4.dst == 10.0.0.1", "next;"));
    view.insert_logical_flow(lflow(2, 2, 40, "tcp.dst == 80", "drop;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    view.clear_tracked();

    // Modify one flow, delete another, add a conjunctive third.
    view.insert_logical_flow(lflow(1, 3, 50, "ip4.dst == 10.0.0.2", "next;"));
    view.remove_logical_flow(&uuid(2));
    view.insert_logical_flow(lflow(3, 0, 10, "ip4.src == $a && ip4.dst == $b", "drop;"));

    engine.clear_processed();
    assert!(engine.handle_tracked_changes(&view, &ctx, &mut sink));

    let mut engine2 = LflowEngine::new(0);
    let mut sink2 = DesiredFlowTable::new();
    engine2.run(&view, &ctx, &mut sink2);
    assert_eq!(sink.snapshot(), sink2.snapshot());
}

#[test]
fn address_set_addition_takes_the_delta_path() {
    let (mut view, mut ctx) = base_setup();
    ctx.addr_sets.insert(
        "s".into(),
        ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2"), v4("3.3.3.3")]),
    );
    view.insert_logical_flow(lflow(1, 0, 10, "ip4.src == $s", "drop;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert_eq!(sink.len(), 3);
    let before = sink.snapshot();

    // Add 4.4.4.4: exactly one new flow, the others untouched.
    ctx.addr_sets.insert(
        "s".into(),
        ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2"), v4("3.3.3.3"), v4("4.4.4.4")]),
    );
    let diff = AddrSetDiff {
        added: Some(ConstSet(vec![v4("4.4.4.4")])),
        deleted: None,
    };
    engine.clear_processed();
    assert!(engine.handle_addr_set_update("s", &diff, &view, &ctx, &mut sink));
    assert_eq!(sink.len(), 4);
    for line in before {
        assert!(sink.snapshot().contains(&line), "existing flow disturbed");
    }
    let added_flow: Vec<_> = sink
        .iter()
        .filter(|f| {
            f.fmatch.get(Mff::Ipv4Src).map(|v| v.value) == Some(0x04040404)
        })
        .collect();
    assert_eq!(added_flow.len(), 1);

    // The delta output equals what a full recompute would produce.
    let mut engine2 = LflowEngine::new(0);
    let mut sink2 = DesiredFlowTable::new();
    engine2.run(&view, &ctx, &mut sink2);
    assert_eq!(sink.snapshot(), sink2.snapshot());
}

#[test]
fn address_set_deletion_removes_tagged_flows() {
    let (mut view, mut ctx) = base_setup();
    ctx.addr_sets.insert(
        "s".into(),
        ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2"), v4("3.3.3.3")]),
    );
    view.insert_logical_flow(lflow(1, 0, 10, "ip4.src == $s", "drop;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);

    ctx.addr_sets
        .insert("s".into(), ConstSet(vec![v4("2.2.2.2"), v4("3.3.3.3")]));
    let diff = AddrSetDiff {
        added: None,
        deleted: Some(ConstSet(vec![v4("1.1.1.1")])),
    };
    engine.clear_processed();
    assert!(engine.handle_addr_set_update("s", &diff, &view, &ctx, &mut sink));
    assert_eq!(sink.len(), 2);
    assert!(sink
        .iter()
        .all(|f| f.fmatch.get(Mff::Ipv4Src).map(|v| v.value) != Some(0x01010101)));
}

#[test]
fn shrinking_to_one_member_declines_the_delta_path() {
    let (mut view, mut ctx) = base_setup();
    ctx.addr_sets
        .insert("s".into(), ConstSet(vec![v4("1.1.1.1"), v4("2.2.2.2")]));
    view.insert_logical_flow(lflow(1, 0, 10, "ip4.src == $s", "drop;"));
    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);

    ctx.addr_sets.insert("s".into(), ConstSet(vec![v4("1.1.1.1")]));
    let diff = AddrSetDiff {
        added: None,
        deleted: Some(ConstSet(vec![v4("2.2.2.2")])),
    };
    engine.clear_processed();
    // New size 1 changes the translation template.
    assert!(!engine.handle_addr_set_update("s", &diff, &view, &ctx, &mut sink));
}

#[test]
fn cached_matches_are_replayed_and_revalidated() {
    let (mut view, mut ctx) = base_setup();
    // Two inline disjunctions make the flow conjunctive without any
    // address-set reference, so it is cacheable as matches.
    view.insert_logical_flow(lflow(
        1,
        0,
        10,
        "ip4.src == {1.1.1.1, 2.2.2.2} && ip4.dst == {3.3.3.3, 4.4.4.4}",
        "drop;",
    ));
    ctx.check_ct_label_for_lb_hairpin = false;

    let mut engine = LflowEngine::new(1 << 20);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert!(matches!(
        engine.cache.get(&uuid(1)),
        Some(CacheValue::Matches { n_conjs: 1, conj_id_ofs: 1, .. })
    ));
    let first = sink.snapshot();

    // Replay from cache into a fresh sink.
    let mut sink2 = DesiredFlowTable::new();
    engine.clear_processed();
    engine.run(&view, &ctx, &mut sink2);
    assert_eq!(first, sink2.snapshot());
    assert!(engine.cache_stats().hits >= 1);

    // Steal the cached conjunction range: the entry must be dropped and
    // the flow recompiled onto fresh ids.
    engine.conj_ids.free_for_flow(&uuid(1));
    engine.conj_ids.alloc(uuid(0xdead), uuid(0x100), 1);
    let mut sink3 = DesiredFlowTable::new();
    engine.clear_processed();
    engine.run(&view, &ctx, &mut sink3);
    let conj_flow: Vec<_> = sink3
        .iter()
        .filter_map(|f| f.fmatch.get(Mff::ConjId).map(|v| v.value))
        .collect();
    assert_eq!(conj_flow, vec![2]);
    assert!(matches!(
        engine.cache.get(&uuid(1)),
        Some(CacheValue::Matches { conj_id_ofs: 2, .. })
    ));
}

#[test]
fn port_lookup_only_flows_are_cached_as_exprs() {
    let (mut view, ctx) = base_setup();
    view.insert_port_binding(PortBindingRow {
        uuid: uuid(0x200),
        logical_port: "lp1".into(),
        ptype: String::new(),
        datapath: uuid(0x100),
        tunnel_key: 5,
        chassis: Some("hv1".into()),
        ha_chassis_group: None,
        port_security: Vec::new(),
    });
    let mut ctx = ctx;
    ctx.related_lport_ids.insert((DP_KEY, 5));
    view.insert_logical_flow(lflow(1, 0, 10, "inport == \"lp1\"", "next;"));

    let mut engine = LflowEngine::new(1 << 20);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert_eq!(sink.len(), 1);
    assert!(matches!(
        engine.cache.get(&uuid(1)),
        Some(CacheValue::Expr { .. })
    ));
}

#[test]
fn multicast_group_reference_recovers_on_appearance() {
    let (mut view, ctx) = base_setup();
    view.insert_logical_flow(lflow(1, 0, 10, "outport == \"mcast1\"", "drop;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert!(sink.is_empty());
    assert_eq!(
        engine
            .refs()
            .lookup_by_symbol(RefType::McastGroup, "7_mcast1"),
        vec![(uuid(1), 0)]
    );

    view.clear_tracked();
    view.insert_multicast_group(McastGroupRow {
        uuid: uuid(0x300),
        name: "mcast1".into(),
        datapath: uuid(0x100),
        tunnel_key: 32768,
    });
    engine.clear_processed();
    assert!(engine.handle_changed_mc_groups(&view, &ctx, &mut sink));
    assert_eq!(sink.len(), 1);
    let flow = sink.iter().next().expect("flow missing");
    assert_eq!(
        flow.fmatch.get(Mff::LOG_OUTPORT).map(|v| v.value),
        Some(32768)
    );
}

#[test]
fn nonlocal_inport_match_is_filtered() {
    let (mut view, mut ctx) = base_setup();
    view.insert_port_binding(PortBindingRow {
        uuid: uuid(0x200),
        logical_port: "lp1".into(),
        ptype: String::new(),
        datapath: uuid(0x100),
        tunnel_key: 5,
        chassis: Some("hv2".into()),
        ha_chassis_group: None,
        port_security: Vec::new(),
    });
    view.insert_logical_flow(lflow(1, 0, 10, "inport == \"lp1\"", "next;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    // The port exists but is not related to this chassis.
    assert!(sink.is_empty());

    ctx.related_lport_ids.insert((DP_KEY, 5));
    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert_eq!(sink.len(), 1);
}

#[traced_test]
#[test]
fn bad_match_or_actions_skip_the_flow() {
    let (mut view, ctx) = base_setup();
    view.insert_logical_flow(lflow(1, 0, 10, "ip4.dst ==", "next;"));
    view.insert_logical_flow(lflow(2, 0, 10, "ip4", "jump_backwards;"));
    view.insert_logical_flow(lflow(3, 0, 10, "ip4", "next;"));

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.iter().next().map(|f| f.cookie), Some(3));
    assert!(logs_contain("error parsing match"));
    assert!(logs_contain("error parsing actions"));
}

#[test]
fn datapath_group_flows_compile_on_each_local_member() {
    let (mut view, mut ctx) = base_setup();
    view.insert_datapath(DatapathRow {
        uuid: uuid(0x101),
        tunnel_key: 8,
        external_ids: empty_tags(),
    });
    ctx.local_datapaths.insert(
        8,
        LocalDatapath {
            datapath: uuid(0x101),
            tunnel_key: 8,
            is_switch: true,
            external_ids: empty_tags(),
        },
    );
    view.insert_dp_group(DpGroupRow {
        uuid: uuid(0x400),
        datapaths: vec![uuid(0x100), uuid(0x101)],
    });
    let mut flow = lflow(1, 0, 10, "ip4.dst == 10.0.0.1", "drop;");
    flow.logical_datapath = None;
    flow.logical_dp_group = Some(uuid(0x400));
    view.insert_logical_flow(flow);

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    // One flow per datapath, differing in metadata.
    assert_eq!(sink.len(), 2);
    let metas: Vec<u128> = sink
        .iter()
        .filter_map(|f| f.fmatch.get(Mff::Metadata).map(|v| v.value))
        .collect();
    assert!(metas.contains(&7) && metas.contains(&8));
}

#[test]
fn lb_hairpin_snat_ip_uses_conjunction_dimensions() {
    let (mut view, ctx) = base_setup();
    view.insert_datapath(DatapathRow {
        uuid: uuid(0x101),
        tunnel_key: 8,
        external_ids: empty_tags(),
    });
    view.insert_load_balancer(LoadBalancerRow {
        uuid: uuid(0x500),
        name: "lb1".into(),
        protocol: "tcp".into(),
        vips: vec![LbVip {
            vip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)),
            vip_port: 80,
            backends: vec![
                LbBackend { ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 20)), port: 8080 },
                LbBackend { ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 21)), port: 8080 },
            ],
        }],
        datapaths: vec![uuid(0x100), uuid(0x101)],
        hairpin_snat_ips: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100))],
        hairpin_orig_tuple: true,
    });

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    let tables = TableMap::default();

    // Detection: one flow per (VIP, backend) pair.
    assert_eq!(flows_in_table(&sink, tables.chk_lb_hairpin), 2);
    for f in sink.iter().filter(|f| f.table_id == tables.chk_lb_hairpin) {
        assert_eq!(f.priority, 100);
        assert!(f.actions.iter().any(|a| matches!(a, OfAction::Learn(_))));
        assert_eq!(
            f.fmatch.get(Mff::LOG_LB_ORIG_DIP_IPV4).map(|v| v.value),
            Some(0x0a00000a)
        );
    }

    // SNAT: one VIP clause, two datapath clauses, one commit flow.
    let snat: Vec<_> = sink
        .iter()
        .filter(|f| f.table_id == tables.ct_snat_hairpin)
        .collect();
    assert_eq!(snat.len(), 4);
    let vip_clauses: Vec<_> = snat
        .iter()
        .filter(|f| {
            f.actions
                == [OfAction::Conjunction { id: 1, clause: 1, n_clauses: 2 }]
        })
        .collect();
    assert_eq!(vip_clauses.len(), 1);
    assert_eq!(vip_clauses[0].priority, 200);
    let dp_clauses: Vec<_> = snat
        .iter()
        .filter(|f| {
            f.actions
                == [OfAction::Conjunction { id: 1, clause: 0, n_clauses: 2 }]
        })
        .collect();
    assert_eq!(dp_clauses.len(), 2);
    let commit: Vec<_> = snat
        .iter()
        .filter(|f| f.fmatch.get(Mff::ConjId).is_some())
        .collect();
    assert_eq!(commit.len(), 1);
    assert_eq!(commit[0].priority, 200);
    match &commit[0].actions[0] {
        OfAction::Ct { commit: true, nat: Some(nat), .. } => {
            assert_eq!(nat.addr, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100))));
            assert!(nat.src);
        }
        other => unreachable!("unexpected action {other:?}"),
    }
}

#[test]
fn lb_without_snat_ip_commits_per_vip() {
    let (mut view, ctx) = base_setup();
    view.insert_load_balancer(LoadBalancerRow {
        uuid: uuid(0x500),
        name: "lb1".into(),
        protocol: "tcp".into(),
        vips: vec![LbVip {
            vip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)),
            vip_port: 80,
            backends: vec![LbBackend {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 20)),
                port: 8080,
            }],
        }],
        datapaths: vec![uuid(0x100)],
        hairpin_snat_ips: Vec::new(),
        hairpin_orig_tuple: true,
    });

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    let tables = TableMap::default();
    let snat: Vec<_> = sink
        .iter()
        .filter(|f| f.table_id == tables.ct_snat_hairpin)
        .collect();
    assert_eq!(snat.len(), 1);
    assert_eq!(snat[0].priority, 100);
    match &snat[0].actions[0] {
        OfAction::Ct { nat: Some(nat), .. } => {
            assert_eq!(nat.addr, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10))));
        }
        other => unreachable!("unexpected action {other:?}"),
    }
}

#[test]
fn deleted_lb_releases_flows_and_id() {
    let (mut view, ctx) = base_setup();
    view.insert_load_balancer(LoadBalancerRow {
        uuid: uuid(0x500),
        name: "lb1".into(),
        protocol: "tcp".into(),
        vips: vec![LbVip {
            vip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)),
            vip_port: 80,
            backends: vec![LbBackend {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 20)),
                port: 8080,
            }],
        }],
        datapaths: vec![uuid(0x100)],
        hairpin_snat_ips: Vec::new(),
        hairpin_orig_tuple: true,
    });
    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert!(!sink.is_empty());

    view.clear_tracked();
    view.remove_load_balancer(&uuid(0x500));
    engine.clear_processed();
    assert!(engine.handle_changed_lbs(&view, &ctx, &mut sink));
    assert!(sink.is_empty());
}

#[test]
fn mac_binding_and_fdb_rows_become_flow_pairs() {
    let (mut view, ctx) = base_setup();
    view.insert_port_binding(PortBindingRow {
        uuid: uuid(0x200),
        logical_port: "lrp1".into(),
        ptype: String::new(),
        datapath: uuid(0x100),
        tunnel_key: 5,
        chassis: None,
        ha_chassis_group: None,
        port_security: Vec::new(),
    });
    view.insert_mac_binding(MacBindingRow {
        uuid: uuid(0x600),
        logical_port: "lrp1".into(),
        ip: "10.0.0.9".into(),
        mac: "0a:00:00:00:00:09".into(),
        datapath: uuid(0x100),
    });
    view.insert_mac_binding(MacBindingRow {
        uuid: uuid(0x601),
        logical_port: "lrp1".into(),
        ip: "10.0.0.9".into(),
        mac: "not a mac".into(),
        datapath: uuid(0x100),
    });
    view.insert_fdb(FdbRow {
        uuid: uuid(0x700),
        mac: "0a:00:00:00:00:10".into(),
        dp_key: DP_KEY,
        port_key: 5,
    });

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    let tables = TableMap::default();
    assert_eq!(flows_in_table(&sink, tables.mac_binding), 1);
    assert_eq!(flows_in_table(&sink, tables.mac_lookup), 1);
    assert_eq!(flows_in_table(&sink, tables.get_fdb), 1);
    assert_eq!(flows_in_table(&sink, tables.lookup_fdb), 1);
}

#[test]
fn port_security_pipeline_shape() {
    let (mut view, ctx) = base_setup();
    view.insert_port_binding(PortBindingRow {
        uuid: uuid(0x200),
        logical_port: "vm1".into(),
        ptype: String::new(),
        datapath: uuid(0x100),
        tunnel_key: 5,
        chassis: Some("hv1".into()),
        ha_chassis_group: None,
        port_security: vec!["0a:00:00:00:00:01 10.0.0.4 2001:db8::4".into()],
    });

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    let tables = TableMap::default();

    assert!(flows_in_table(&sink, tables.chk_in_port_sec) > 0);
    assert!(flows_in_table(&sink, tables.chk_in_port_sec_nd) > 0);
    assert!(flows_in_table(&sink, tables.chk_out_port_sec) > 0);

    // The IPv6 NS default in the ND table allows instead of dropping.
    let ns_default: Vec<_> = sink
        .iter()
        .filter(|f| {
            f.table_id == tables.chk_in_port_sec_nd
                && f.priority == 80
                && f.fmatch.get(Mff::IcmpType).map(|v| v.value) == Some(135)
        })
        .collect();
    assert_eq!(ns_default.len(), 1);
    assert_eq!(
        ns_default[0].actions,
        &[OfAction::SetField { field: Mff::Reg10, ofs: 12, n_bits: 1, value: 0 }]
    );

    // The DHCPv4 allow keeps the client-to-server port pair.
    let dhcp: Vec<_> = sink
        .iter()
        .filter(|f| f.fmatch.get(Mff::UdpSrc).is_some())
        .collect();
    assert_eq!(dhcp.len(), 1);
    assert_eq!(dhcp[0].fmatch.get(Mff::UdpSrc).map(|v| v.value), Some(68));
    assert_eq!(dhcp[0].fmatch.get(Mff::UdpDst).map(|v| v.value), Some(67));

    // Residency change replays the pipeline from scratch.
    let n_before = sink.len();
    let pb = view.pb_by_name("vm1").expect("pb missing").clone();
    engine.clear_processed();
    assert!(engine.handle_flows_for_lport(&pb, &view, &ctx, &mut sink));
    assert_eq!(sink.len(), n_before);
}

#[test]
fn datapath_activation_compiles_scoped_flows_once() {
    let (mut view, mut ctx) = base_setup();
    view.insert_datapath(DatapathRow {
        uuid: uuid(0x101),
        tunnel_key: 8,
        external_ids: empty_tags(),
    });
    view.insert_dp_group(DpGroupRow {
        uuid: uuid(0x400),
        datapaths: vec![uuid(0x101)],
    });
    let mut direct = lflow(1, 0, 10, "ip4", "drop;");
    direct.logical_datapath = Some(uuid(0x101));
    view.insert_logical_flow(direct);
    let mut grouped = lflow(2, 0, 20, "ip6", "drop;");
    grouped.logical_datapath = None;
    grouped.logical_dp_group = Some(uuid(0x400));
    view.insert_logical_flow(grouped);

    // Not local yet: nothing compiles.
    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert!(sink.is_empty());

    // The datapath becomes local.
    ctx.local_datapaths.insert(
        8,
        LocalDatapath {
            datapath: uuid(0x101),
            tunnel_key: 8,
            is_switch: true,
            external_ids: empty_tags(),
        },
    );
    engine.clear_processed();
    let dp = view.datapaths.get(&uuid(0x101)).expect("dp missing").clone();
    assert!(engine.add_flows_for_datapath(&dp, &[], &view, &ctx, &mut sink));
    assert_eq!(sink.len(), 2);
}

#[test]
fn controller_meter_is_interned() {
    let (mut view, ctx) = base_setup();
    let mut flow = lflow(1, 0, 10, "ip4", "next;");
    flow.controller_meter = Some("acl-meter".into());
    view.insert_logical_flow(flow);

    let mut engine = LflowEngine::new(0);
    let mut sink = DesiredFlowTable::new();
    engine.run(&view, &ctx, &mut sink);
    assert_eq!(sink.iter().next().and_then(|f| f.meter_id), Some(1));
}
