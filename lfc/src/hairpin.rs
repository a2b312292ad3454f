// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Load-balancer hairpin flow generation.
//!
//! Hairpin traffic is a backend talking to a VIP that the load balancer
//! resolved back to the same backend; the reply would short-circuit
//! inside the host unless the source is NATed. Detection flows mark
//! such sessions (and learn the reply-side flows); SNAT flows rewrite
//! the source to the VIP, or to `hairpin_snat_ip` via a two-clause
//! conjunction over the VIP set and the datapath set.

use crate::view::{ChassisCtx, LbBackend, LbVip, LoadBalancerRow, SbView};
use oflow::desired::uuid_cookie;
use oflow::field::{cs, CT_NATTED};
use oflow::{FlowSink, LearnAction, LearnSpec, Match, Mff, Mlf, NatAction, OfAction};
use std::net::IpAddr;
use tracing::debug;

const ETH_IP: u16 = 0x0800;
const ETH_IPV6: u16 = 0x86dd;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_SCTP: u8 = 132;

fn lb_proto(lb: &LoadBalancerRow) -> u8 {
    match lb.protocol.as_str() {
        "udp" => PROTO_UDP,
        "sctp" => PROTO_SCTP,
        _ => PROTO_TCP,
    }
}

fn l4_dst_field(proto: u8) -> Mff {
    match proto {
        PROTO_UDP => Mff::UdpDst,
        PROTO_SCTP => Mff::SctpDst,
        _ => Mff::TcpDst,
    }
}

fn l4_src_field(proto: u8) -> Mff {
    match proto {
        PROTO_UDP => Mff::UdpSrc,
        PROTO_SCTP => Mff::SctpSrc,
        _ => Mff::TcpSrc,
    }
}

fn ip_value(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

/// The first configured hairpin SNAT address of the VIP's family, or
/// the VIP itself.
fn snat_vip(lb: &LoadBalancerRow, vip: &IpAddr) -> IpAddr {
    lb.hairpin_snat_ips
        .iter()
        .find(|a| a.is_ipv4() == vip.is_ipv4())
        .copied()
        .unwrap_or(*vip)
}

fn has_snat_ip_for(lb: &LoadBalancerRow, vip: &IpAddr) -> bool {
    lb.hairpin_snat_ips
        .iter()
        .any(|a| a.is_ipv4() == vip.is_ipv4())
}

/// The learn action planting the reply-side hairpin flow: when the
/// backend answers towards the (SNATed) VIP, the reply is marked too.
fn hairpin_reply_learn(
    lb: &LoadBalancerRow,
    vip: &LbVip,
    backend: &LbBackend,
    proto: u8,
    ctx: &ChassisCtx,
) -> OfAction {
    let reply_dst = snat_vip(lb, &vip.vip);
    let v6 = !vip.vip.is_ipv4();
    let mut specs = vec![
        LearnSpec::MatchField {
            dst: Mff::Metadata,
            src: Mff::Metadata,
        },
        LearnSpec::MatchImmediate {
            field: Mff::EthType,
            value: u128::from(if v6 { ETH_IPV6 } else { ETH_IP }),
        },
        LearnSpec::MatchField {
            dst: if v6 { Mff::Ipv6Src } else { Mff::Ipv4Src },
            src: if v6 { Mff::Ipv6Src } else { Mff::Ipv4Src },
        },
        LearnSpec::MatchImmediate {
            field: if v6 { Mff::Ipv6Dst } else { Mff::Ipv4Dst },
            value: ip_value(&reply_dst),
        },
        LearnSpec::MatchImmediate {
            field: Mff::IpProto,
            value: u128::from(proto),
        },
    ];
    if backend.port != 0 {
        specs.push(LearnSpec::MatchField {
            dst: l4_src_field(proto),
            src: l4_dst_field(proto),
        });
    }
    specs.push(LearnSpec::Load {
        field: Mff::LOG_FLAGS,
        ofs: Mlf::LookupLbHairpin.bit(),
        n_bits: 1,
        value: 1,
    });
    OfAction::Learn(LearnAction {
        table_id: ctx.tables.chk_lb_hairpin_reply,
        priority: 32768,
        cookie: uuid_cookie(&lb.uuid),
        delete_learned: true,
        specs,
    })
}

/// Detection flows for one `(VIP, backend)` pair.
#[allow(clippy::too_many_arguments)]
fn add_lb_vip_hairpin_flows<S: FlowSink>(
    lb: &LoadBalancerRow,
    vip: &LbVip,
    backend: &LbBackend,
    proto: u8,
    ctx: &ChassisCtx,
    sink: &mut S,
) {
    let mut actions = vec![OfAction::load_bit(
        Mff::LOG_FLAGS,
        Mlf::LookupLbHairpin.bit(),
        true,
    )];
    actions.push(hairpin_reply_learn(lb, vip, backend, proto, ctx));

    let mut m = Match::new();

    // Matching the original conntrack destination needs a tracked,
    // DNATed state first.
    if !lb.hairpin_orig_tuple {
        m.set_masked(Mff::CtState, cs::TRK | cs::DNAT, cs::TRK | cs::DNAT);
    }

    let v4 = backend.ip.is_ipv4();
    m.set_eth_type(if v4 { ETH_IP } else { ETH_IPV6 });
    let (src_field, dst_field) = if v4 {
        (Mff::Ipv4Src, Mff::Ipv4Dst)
    } else {
        (Mff::Ipv6Src, Mff::Ipv6Dst)
    };
    m.set(src_field, ip_value(&backend.ip));
    m.set(dst_field, ip_value(&backend.ip));

    if !lb.hairpin_orig_tuple {
        let ct_dst = if v4 { Mff::CtNwDst } else { Mff::CtIpv6Dst };
        m.set(ct_dst, ip_value(&vip.vip));
    } else if v4 {
        m.set(Mff::LOG_LB_ORIG_DIP_IPV4, ip_value(&vip.vip));
    } else {
        m.set(Mff::LOG_LB_ORIG_DIP_IPV6, ip_value(&vip.vip));
    }

    if backend.port != 0 {
        m.set_nw_proto(proto);
        m.set(l4_dst_field(proto), u128::from(backend.port));
        if !lb.hairpin_orig_tuple {
            m.set(Mff::CtNwProto, u128::from(proto));
            m.set(Mff::CtTpDst, u128::from(vip.vip_port));
        } else {
            m.set_masked(
                Mff::LOG_LB_ORIG_TP_DPORT,
                u128::from(vip.vip_port),
                0xffff,
            );
        }
    }

    // Only traffic a load balancer already NATed can hairpin.
    m.set_masked(Mff::CtMark, CT_NATTED, CT_NATTED);

    sink.add_flow(
        ctx.tables.chk_lb_hairpin,
        100,
        m.clone(),
        actions.clone(),
        lb.uuid,
    );

    // Upgrades from controllers that used ct_label for the NAT marker
    // still have such connections in the tables; match them too.
    if ctx.check_ct_label_for_lb_hairpin {
        m.clear(Mff::CtMark);
        m.set_masked(Mff::CtLabel, CT_NATTED, CT_NATTED);
        sink.add_flow(ctx.tables.chk_lb_hairpin, 100, m, actions, lb.uuid);
    }
}

/// The per-VIP SNAT flow: a direct CT/NAT commit in the general case,
/// clause 1 of the conjunction when `hairpin_snat_ip` is in play.
fn add_lb_ct_snat_hairpin_vip_flow<S: FlowSink>(
    lb: &LoadBalancerRow,
    id: u32,
    vip: &LbVip,
    proto: u8,
    ctx: &ChassisCtx,
    sink: &mut S,
) {
    let use_snat_ip = has_snat_ip_for(lb, &vip.vip);
    // The conjunctive flow would shadow the general one on the same
    // match, so it runs at a higher priority.
    let priority = if use_snat_ip { 200 } else { 100 };

    let actions = if use_snat_ip {
        vec![OfAction::Conjunction {
            id,
            clause: 1,
            n_clauses: 2,
        }]
    } else {
        vec![OfAction::Ct {
            commit: true,
            zone_src: Mff::LOG_SNAT_ZONE,
            recirc_table: None,
            nat: Some(NatAction {
                src: true,
                addr: Some(vip.vip),
            }),
        }]
    };

    let mut m = Match::new();
    if !lb.hairpin_orig_tuple {
        m.set_masked(Mff::CtState, cs::TRK | cs::DNAT, cs::TRK | cs::DNAT);
    }
    let v4 = vip.vip.is_ipv4();
    m.set_eth_type(if v4 { ETH_IP } else { ETH_IPV6 });
    if !lb.hairpin_orig_tuple {
        let ct_dst = if v4 { Mff::CtNwDst } else { Mff::CtIpv6Dst };
        m.set(ct_dst, ip_value(&vip.vip));
    } else if v4 {
        m.set(Mff::LOG_LB_ORIG_DIP_IPV4, ip_value(&vip.vip));
    } else {
        m.set(Mff::LOG_LB_ORIG_DIP_IPV6, ip_value(&vip.vip));
    }

    m.set_nw_proto(proto);
    if vip.vip_port != 0 {
        if !lb.hairpin_orig_tuple {
            m.set(Mff::CtNwProto, u128::from(proto));
            m.set(Mff::CtTpDst, u128::from(vip.vip_port));
        } else {
            m.set_masked(
                Mff::LOG_LB_ORIG_TP_DPORT,
                u128::from(vip.vip_port),
                0xffff,
            );
        }
    }

    // The same VIP may appear on several load balancers; their clauses
    // merge on one flow.
    sink.add_or_append_flow(
        ctx.tables.ct_snat_hairpin,
        priority,
        m,
        actions,
        None,
        lb.uuid,
        None,
    );
}

/// The datapath dimension and the commit flow of the
/// `hairpin_snat_ip` conjunction.
fn add_lb_ct_snat_hairpin_dp_flows<S: FlowSink>(
    lb: &LoadBalancerRow,
    id: u32,
    view: &SbView,
    ctx: &ChassisCtx,
    sink: &mut S,
) {
    if lb.hairpin_snat_ips.is_empty() {
        // No conjunctive VIP flows were emitted for this LB.
        return;
    }

    for dp_uuid in &lb.datapaths {
        let Some(dp) = view.datapaths.get(dp_uuid) else {
            continue;
        };
        let mut m = Match::new();
        m.set_metadata(dp.tunnel_key);
        sink.add_or_append_flow(
            ctx.tables.ct_snat_hairpin,
            200,
            m,
            vec![OfAction::Conjunction {
                id,
                clause: 0,
                n_clauses: 2,
            }],
            None,
            lb.uuid,
            None,
        );
    }

    // One commit flow per address family, using its first address.
    let first_v4 = lb.hairpin_snat_ips.iter().find(|a| a.is_ipv4());
    let first_v6 = lb.hairpin_snat_ips.iter().find(|a| !a.is_ipv4());
    for snat_ip in [first_v4, first_v6].into_iter().flatten() {
        let mut m = Match::new();
        m.set_conj_id(id);
        m.set_eth_type(if snat_ip.is_ipv4() { ETH_IP } else { ETH_IPV6 });
        sink.add_flow(
            ctx.tables.ct_snat_hairpin,
            200,
            m,
            vec![OfAction::Ct {
                commit: true,
                zone_src: Mff::LOG_SNAT_ZONE,
                recirc_table: None,
                nat: Some(NatAction {
                    src: true,
                    addr: Some(*snat_ip),
                }),
            }],
            lb.uuid,
        );
    }
}

/// Emit every hairpin flow for one load balancer, if any of its
/// datapaths is local.
pub(crate) fn consider_lb_hairpin_flows<S: FlowSink>(
    lb: &LoadBalancerRow,
    id: u32,
    view: &SbView,
    ctx: &ChassisCtx,
    sink: &mut S,
) {
    debug!("load balancer {} has conjunctive flow id {id}", lb.name);

    let local = lb.datapaths.iter().any(|dp_uuid| {
        view.datapaths
            .get(dp_uuid)
            .is_some_and(|dp| ctx.local_datapath(dp.tunnel_key).is_some())
    });
    if !local {
        return;
    }

    let proto = lb_proto(lb);
    for vip in &lb.vips {
        for backend in &vip.backends {
            add_lb_vip_hairpin_flows(lb, vip, backend, proto, ctx, sink);
        }
    }

    for vip in &lb.vips {
        add_lb_ct_snat_hairpin_vip_flow(lb, id, vip, proto, ctx, sink);
    }
    add_lb_ct_snat_hairpin_dp_flows(lb, id, view, ctx, sink);
}
