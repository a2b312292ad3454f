// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port-security flow generation.
//!
//! Each local port with `port_security` entries gets a pipeline of
//! checks: two ingress tables (the second one dedicated to ARP/ND) and
//! one egress table. The default verdict in every table is "failed";
//! higher-priority flows clear the flag for traffic the entry permits.

use crate::neighbors::parse_mac;
use crate::view::{ChassisCtx, PortBindingRow, SbView};
use oflow::{FlowSink, Match, Mff, Mlf, OfAction};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::info;
use uuid::Uuid;

const ETH_IP: u16 = 0x0800;
const ETH_IPV6: u16 = 0x86dd;
const ETH_ARP: u16 = 0x0806;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

/// A configured IPv4 address with prefix length.
#[derive(Debug, Clone, Copy)]
struct Ipv4Net {
    addr: Ipv4Addr,
    plen: u8,
}

impl Ipv4Net {
    fn mask(&self) -> Ipv4Addr {
        if self.plen == 0 {
            Ipv4Addr::from(0)
        } else {
            Ipv4Addr::from(u32::MAX << (32 - u32::from(self.plen)))
        }
    }

    fn host_bits_nonzero(&self) -> bool {
        u32::from(self.addr) & !u32::from(self.mask()) != 0
    }

    fn bcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.mask()))
    }
}

/// A configured IPv6 address with prefix length.
#[derive(Debug, Clone, Copy)]
struct Ipv6Net {
    addr: Ipv6Addr,
    plen: u8,
}

impl Ipv6Net {
    fn mask(&self) -> u128 {
        if self.plen == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(self.plen))
        }
    }

    fn host_bits_nonzero(&self) -> bool {
        u128::from(self.addr) & !self.mask() != 0
    }

    fn network(&self) -> u128 {
        u128::from(self.addr) & self.mask()
    }
}

/// One decoded `port_security` entry.
#[derive(Debug, Clone)]
struct LportAddresses {
    mac: u64,
    ipv4: Vec<Ipv4Net>,
    ipv6: Vec<Ipv6Net>,
}

/// Decode "<mac> [<addr>[/plen]]...". Returns `None` when no valid MAC
/// leads the entry.
fn parse_lport_addresses(entry: &str) -> Option<LportAddresses> {
    let mut tokens = entry.split_whitespace();
    let mac = parse_mac(tokens.next()?)?;
    let mut out = LportAddresses {
        mac,
        ipv4: Vec::new(),
        ipv6: Vec::new(),
    };
    for token in tokens {
        let (addr, plen) = match token.split_once('/') {
            Some((a, p)) => (a, Some(p.parse::<u8>().ok()?)),
            None => (token, None),
        };
        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            let plen = plen.unwrap_or(32);
            if plen > 32 {
                return None;
            }
            out.ipv4.push(Ipv4Net { addr: v4, plen });
        } else if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            let plen = plen.unwrap_or(128);
            if plen > 128 {
                return None;
            }
            out.ipv6.push(Ipv6Net { addr: v6, plen });
        } else {
            return None;
        }
    }
    Some(out)
}

/// The EUI-64 link-local address derived from a MAC.
fn link_local(mac: u64) -> Ipv6Addr {
    let b = mac.to_be_bytes();
    // b[0] is always 0 for a 48-bit value in a u64.
    Ipv6Addr::from([
        0xfe, 0x80, 0, 0, 0, 0, 0, 0,
        b[2] ^ 0x02, b[3], b[4], 0xff, 0xfe, b[5], b[6], b[7],
    ])
}

fn deny_action() -> Vec<OfAction> {
    vec![OfAction::load_bit(Mff::LOG_FLAGS, Mlf::CheckPortSec.bit(), true)]
}

fn allow_action() -> Vec<OfAction> {
    vec![OfAction::load_bit(Mff::LOG_FLAGS, Mlf::CheckPortSec.bit(), false)]
}

fn adv_nd_check_action(ctx: &ChassisCtx) -> Vec<OfAction> {
    vec![OfAction::Resubmit {
        table: ctx.tables.chk_in_port_sec_nd,
    }]
}

fn port_match(dp_key: u64, port_key: u64, reg: Mff) -> Match {
    let mut m = Match::new();
    m.set_metadata(dp_key);
    m.set_reg(reg, port_key as u32);
    m
}

struct PsCtx<'a> {
    uuid: Uuid,
    dp_key: u64,
    port_key: u64,
    ctx: &'a ChassisCtx,
}

impl PsCtx<'_> {
    fn in_match(&self) -> Match {
        port_match(self.dp_key, self.port_key, Mff::LOG_INPORT)
    }

    fn out_match(&self) -> Match {
        port_match(self.dp_key, self.port_key, Mff::LOG_OUTPORT)
    }
}

/// Emit the port-security pipeline for one port binding.
pub(crate) fn consider_port_sec_flows<S: FlowSink>(
    pb: &PortBindingRow,
    view: &SbView,
    ctx: &ChassisCtx,
    sink: &mut S,
) {
    if pb.port_security.is_empty() {
        return;
    }
    let Some(dp) = view.datapaths.get(&pb.datapath) else {
        return;
    };

    let mut addrs = Vec::new();
    for entry in &pb.port_security {
        match parse_lport_addresses(entry) {
            Some(a) => addrs.push(a),
            None => {
                info!("invalid syntax '{entry}' in port security, no MAC address found");
            }
        }
    }
    if addrs.is_empty() {
        return;
    }

    let ps = PsCtx {
        uuid: pb.uuid,
        dp_key: dp.tunnel_key,
        port_key: pb.tunnel_key,
        ctx,
    };

    build_in_port_sec_default_flows(&ps, sink);
    for a in &addrs {
        build_in_port_sec_no_ip_flows(&ps, a, sink);
        build_in_port_sec_ip4_flows(&ps, a, sink);
        build_in_port_sec_arp_flows(&ps, a, sink);
        build_in_port_sec_ip6_flows(&ps, a, sink);
        build_in_port_sec_nd_flows(&ps, a, sink);
    }

    // Egress: default deny, then per-entry allows.
    sink.add_flow(
        ctx.tables.chk_out_port_sec,
        80,
        ps.out_match(),
        deny_action(),
        ps.uuid,
    );
    for a in &addrs {
        build_out_port_sec_no_ip_flows(&ps, a, sink);
        build_out_port_sec_ip4_flows(&ps, a, sink);
        build_out_port_sec_ip6_flows(&ps, a, sink);
    }
}

fn build_in_port_sec_default_flows<S: FlowSink>(ps: &PsCtx<'_>, sink: &mut S) {
    let tables = &ps.ctx.tables;

    // Default: everything from the port fails port security.
    sink.add_flow(tables.chk_in_port_sec, 80, ps.in_match(), deny_action(), ps.uuid);

    // ARP is judged in the dedicated table.
    let mut m = ps.in_match();
    m.set_eth_type(ETH_ARP);
    sink.add_flow(
        tables.chk_in_port_sec,
        95,
        m,
        adv_nd_check_action(ps.ctx),
        ps.uuid,
    );

    // ND table defaults: drop ARP, drop NA.
    let mut m = ps.in_match();
    m.set_eth_type(ETH_ARP);
    sink.add_flow(tables.chk_in_port_sec_nd, 80, m.clone(), deny_action(), ps.uuid);

    let mut m = ps.in_match();
    m.set_eth_type(ETH_IPV6);
    m.set_nw_proto(PROTO_ICMPV6);
    m.set(Mff::NwTtl, 255);
    m.set(Mff::IcmpType, 136);
    sink.add_flow(tables.chk_in_port_sec_nd, 80, m.clone(), deny_action(), ps.uuid);

    // NS is allowed by default: with a default drop, an NS carrying a
    // valid nd.sll has been seen matching the priority-80 drop instead
    // of the priority-90 allow in the vswitch classifier. Keep the
    // allow until that misclassification is tracked down.
    m.set(Mff::IcmpType, 135);
    sink.add_flow(tables.chk_in_port_sec_nd, 80, m, allow_action(), ps.uuid);
}

fn build_in_port_sec_no_ip_flows<S: FlowSink>(
    ps: &PsCtx<'_>,
    a: &LportAddresses,
    sink: &mut S,
) {
    if !a.ipv4.is_empty() || !a.ipv6.is_empty() {
        return;
    }
    let mut m = ps.in_match();
    m.set_dl_src(a.mac);
    sink.add_flow(
        ps.ctx.tables.chk_in_port_sec,
        90,
        m,
        adv_nd_check_action(ps.ctx),
        ps.uuid,
    );
}

fn build_in_port_sec_ip4_flows<S: FlowSink>(ps: &PsCtx<'_>, a: &LportAddresses, sink: &mut S) {
    if a.ipv4.is_empty() {
        // Without IPv4 addresses the port may not send IPv4 at all; the
        // default flows already drop it.
        return;
    }

    for net in &a.ipv4 {
        let mut m = ps.in_match();
        m.set_dl_src(a.mac);
        m.set_eth_type(ETH_IP);
        // A /32, or a masked address with nonzero host bits, pins the
        // exact address; a clean subnet allows the whole range.
        if net.plen == 32 || net.host_bits_nonzero() {
            m.set_nw_src(net.addr);
        } else {
            m.set_nw_src_masked(net.addr, net.mask());
        }
        sink.add_flow(ps.ctx.tables.chk_in_port_sec, 90, m, allow_action(), ps.uuid);
    }

    // DHCPv4 discovery comes from 0.0.0.0.
    let mut m = ps.in_match();
    m.set_dl_src(a.mac);
    m.set_eth_type(ETH_IP);
    m.set_nw_src(Ipv4Addr::from(0));
    m.set_nw_dst(Ipv4Addr::from(u32::MAX));
    m.set_nw_proto(PROTO_UDP);
    m.set(Mff::UdpSrc, 68);
    m.set(Mff::UdpDst, 67);
    sink.add_flow(ps.ctx.tables.chk_in_port_sec, 90, m, allow_action(), ps.uuid);
}

fn build_in_port_sec_arp_flows<S: FlowSink>(ps: &PsCtx<'_>, a: &LportAddresses, sink: &mut S) {
    if a.ipv4.is_empty() && !a.ipv6.is_empty() {
        // Only IPv6 configured: no ARP.
        return;
    }

    if a.ipv4.is_empty() {
        let mut m = ps.in_match();
        m.set_dl_src(a.mac);
        m.set_eth_type(ETH_ARP);
        m.set(Mff::ArpSha, u128::from(a.mac));
        sink.add_flow(ps.ctx.tables.chk_in_port_sec_nd, 90, m, allow_action(), ps.uuid);
    }

    for net in &a.ipv4 {
        let mut m = ps.in_match();
        m.set_dl_src(a.mac);
        m.set_eth_type(ETH_ARP);
        m.set(Mff::ArpSha, u128::from(a.mac));
        if net.plen == 32 || net.host_bits_nonzero() {
            m.set(Mff::ArpSpa, u128::from(u32::from(net.addr)));
        } else {
            m.set_masked(
                Mff::ArpSpa,
                u128::from(u32::from(net.addr)),
                u128::from(u32::from(net.mask())),
            );
        }
        sink.add_flow(ps.ctx.tables.chk_in_port_sec_nd, 90, m, allow_action(), ps.uuid);
    }
}

fn build_in_port_sec_ip6_flows<S: FlowSink>(ps: &PsCtx<'_>, a: &LportAddresses, sink: &mut S) {
    if a.ipv6.is_empty() {
        return;
    }

    // Sources the entry allows advance to the NS/NA checks.
    for net in &a.ipv6 {
        let mut m = ps.in_match();
        m.set_dl_src(a.mac);
        m.set_eth_type(ETH_IPV6);
        if net.plen == 128 || net.host_bits_nonzero() {
            m.set_ipv6_src(net.addr);
        } else {
            m.set_masked(Mff::Ipv6Src, net.network(), net.mask());
        }
        sink.add_flow(
            ps.ctx.tables.chk_in_port_sec,
            90,
            m,
            adv_nd_check_action(ps.ctx),
            ps.uuid,
        );
    }

    let mut m = ps.in_match();
    m.set_dl_src(a.mac);
    m.set_eth_type(ETH_IPV6);
    m.set_ipv6_src(link_local(a.mac));
    sink.add_flow(
        ps.ctx.tables.chk_in_port_sec,
        90,
        m.clone(),
        adv_nd_check_action(ps.ctx),
        ps.uuid,
    );

    // MLD reports from the unspecified source.
    m.set_ipv6_src(Ipv6Addr::from(0u128));
    m.set_masked(Mff::Ipv6Dst, 0xff02u128 << 112, 0xffffu128 << 112);
    m.set_nw_proto(PROTO_ICMPV6);
    m.set(Mff::IcmpType, 131);
    m.set(Mff::IcmpCode, 0);
    sink.add_flow(ps.ctx.tables.chk_in_port_sec, 90, m.clone(), allow_action(), ps.uuid);

    m.set(Mff::IcmpType, 143);
    sink.add_flow(ps.ctx.tables.chk_in_port_sec, 90, m.clone(), allow_action(), ps.uuid);

    // Duplicate-address-detection NS advances to the ND table.
    m.set(Mff::IcmpType, 135);
    sink.add_flow(
        ps.ctx.tables.chk_in_port_sec,
        90,
        m,
        adv_nd_check_action(ps.ctx),
        ps.uuid,
    );
}

fn build_in_port_sec_nd_flows<S: FlowSink>(ps: &PsCtx<'_>, a: &LportAddresses, sink: &mut S) {
    let tables = &ps.ctx.tables;

    // NS: the source link-layer option must be absent or the port's MAC.
    let mut m = ps.in_match();
    m.set_eth_type(ETH_IPV6);
    m.set_nw_proto(PROTO_ICMPV6);
    m.set(Mff::NwTtl, 225);
    m.set(Mff::IcmpType, 135);
    m.set(Mff::IcmpCode, 0);

    m.set(Mff::ArpSha, 0);
    sink.add_flow(tables.chk_in_port_sec_nd, 90, m.clone(), allow_action(), ps.uuid);
    m.set(Mff::ArpSha, u128::from(a.mac));
    sink.add_flow(tables.chk_in_port_sec_nd, 90, m.clone(), allow_action(), ps.uuid);

    // NA: the target link-layer option must be absent or the port's
    // MAC, and with addresses configured the target must be one of
    // them (or the link-local address).
    m.clear(Mff::ArpSha);
    m.set(Mff::IcmpType, 136);
    m.set(Mff::IcmpCode, 0);
    if !a.ipv6.is_empty() {
        let lla = link_local(a.mac);

        m.set(Mff::ArpTha, 0);
        m.set(Mff::NdTarget, u128::from(lla));
        sink.add_flow(tables.chk_in_port_sec_nd, 90, m.clone(), allow_action(), ps.uuid);
        m.set(Mff::ArpTha, u128::from(a.mac));
        sink.add_flow(tables.chk_in_port_sec_nd, 90, m.clone(), allow_action(), ps.uuid);

        for net in &a.ipv6 {
            let mut m = ps.in_match();
            m.set_dl_src(a.mac);
            m.set_eth_type(ETH_IPV6);
            m.set_nw_proto(PROTO_ICMPV6);
            m.set(Mff::IcmpType, 136);
            m.set(Mff::IcmpCode, 0);
            m.set(Mff::ArpTha, 0);
            if net.plen == 128 || net.host_bits_nonzero() {
                m.set(Mff::NdTarget, u128::from(net.addr));
            } else {
                m.set_masked(Mff::NdTarget, net.network(), net.mask());
            }
            sink.add_flow(tables.chk_in_port_sec_nd, 90, m.clone(), allow_action(), ps.uuid);

            m.set(Mff::ArpTha, u128::from(a.mac));
            sink.add_flow(tables.chk_in_port_sec_nd, 90, m, allow_action(), ps.uuid);
        }
    } else {
        m.set(Mff::ArpTha, 0);
        sink.add_flow(tables.chk_in_port_sec_nd, 90, m.clone(), allow_action(), ps.uuid);
        m.set(Mff::ArpTha, u128::from(a.mac));
        sink.add_flow(tables.chk_in_port_sec_nd, 90, m, allow_action(), ps.uuid);
    }
}

fn build_out_port_sec_no_ip_flows<S: FlowSink>(
    ps: &PsCtx<'_>,
    a: &LportAddresses,
    sink: &mut S,
) {
    // Anything addressed to the entry's MAC may be delivered; the IP
    // filters below override this for IP traffic when addresses are
    // configured.
    let mut m = ps.out_match();
    m.set_dl_dst(a.mac);
    sink.add_flow(ps.ctx.tables.chk_out_port_sec, 85, m, allow_action(), ps.uuid);
}

fn build_out_port_sec_ip4_flows<S: FlowSink>(ps: &PsCtx<'_>, a: &LportAddresses, sink: &mut S) {
    if a.ipv4.is_empty() && a.ipv6.is_empty() {
        return;
    }

    // Default deny for IPv4 to this MAC; allows follow.
    let mut m = ps.out_match();
    m.set_dl_dst(a.mac);
    m.set_eth_type(ETH_IP);
    sink.add_flow(ps.ctx.tables.chk_out_port_sec, 90, m, deny_action(), ps.uuid);

    if a.ipv4.is_empty() {
        return;
    }

    for net in &a.ipv4 {
        let mut m = ps.out_match();
        m.set_dl_dst(a.mac);
        m.set_eth_type(ETH_IP);
        if net.plen == 32 || net.host_bits_nonzero() {
            if net.plen != 32 {
                // A host address carries its subnet broadcast along.
                let mut bm = m.clone();
                bm.set_nw_dst(net.bcast());
                sink.add_flow(ps.ctx.tables.chk_out_port_sec, 95, bm, allow_action(), ps.uuid);
            }
            m.set_nw_dst(net.addr);
        } else {
            m.set_nw_dst_masked(net.addr, net.mask());
        }
        sink.add_flow(ps.ctx.tables.chk_out_port_sec, 95, m, allow_action(), ps.uuid);
    }

    let mut m = ps.out_match();
    m.set_dl_dst(a.mac);
    m.set_eth_type(ETH_IP);
    m.set_nw_dst(Ipv4Addr::from(u32::MAX));
    sink.add_flow(ps.ctx.tables.chk_out_port_sec, 95, m.clone(), allow_action(), ps.uuid);

    m.clear(Mff::Ipv4Dst);
    m.set_nw_dst_masked(Ipv4Addr::new(224, 0, 0, 0), Ipv4Addr::new(240, 0, 0, 0));
    sink.add_flow(ps.ctx.tables.chk_out_port_sec, 95, m, allow_action(), ps.uuid);
}

fn build_out_port_sec_ip6_flows<S: FlowSink>(ps: &PsCtx<'_>, a: &LportAddresses, sink: &mut S) {
    if a.ipv4.is_empty() && a.ipv6.is_empty() {
        return;
    }

    let mut m = ps.out_match();
    m.set_dl_dst(a.mac);
    m.set_eth_type(ETH_IPV6);
    sink.add_flow(ps.ctx.tables.chk_out_port_sec, 90, m, deny_action(), ps.uuid);

    if a.ipv6.is_empty() {
        return;
    }

    for net in &a.ipv6 {
        let mut m = ps.out_match();
        m.set_dl_dst(a.mac);
        m.set_eth_type(ETH_IPV6);
        if net.plen == 128 || net.host_bits_nonzero() {
            m.set_ipv6_dst(net.addr);
        } else {
            m.set_masked(Mff::Ipv6Dst, net.network(), net.mask());
        }
        sink.add_flow(ps.ctx.tables.chk_out_port_sec, 95, m, allow_action(), ps.uuid);
    }

    let mut m = ps.out_match();
    m.set_dl_dst(a.mac);
    m.set_eth_type(ETH_IPV6);
    m.set_ipv6_dst(link_local(a.mac));
    sink.add_flow(ps.ctx.tables.chk_out_port_sec, 95, m.clone(), allow_action(), ps.uuid);

    m.clear(Mff::Ipv6Dst);
    m.set_masked(Mff::Ipv6Dst, 0xffu128 << 120, 0xffu128 << 120);
    sink.add_flow(ps.ctx.tables.chk_out_port_sec, 95, m, allow_action(), ps.uuid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lport_addresses_parsing() {
        let a = parse_lport_addresses("0a:00:00:00:00:01 10.0.0.4 2001:db8::4/64").expect("parse");
        assert_eq!(a.mac, 0x0a0000000001);
        assert_eq!(a.ipv4.len(), 1);
        assert_eq!(a.ipv4[0].plen, 32);
        assert_eq!(a.ipv6.len(), 1);
        assert_eq!(a.ipv6[0].plen, 64);
        assert!(parse_lport_addresses("banana").is_none());
        assert!(parse_lport_addresses("0a:00:00:00:00:01 999.0.0.1").is_none());
    }

    #[test]
    fn subnet_helpers() {
        let net = Ipv4Net { addr: Ipv4Addr::new(10, 0, 0, 4), plen: 24 };
        assert!(net.host_bits_nonzero());
        assert_eq!(net.bcast(), Ipv4Addr::new(10, 0, 0, 255));
        let clean = Ipv4Net { addr: Ipv4Addr::new(10, 0, 0, 0), plen: 24 };
        assert!(!clean.host_bits_nonzero());
    }

    #[test]
    fn link_local_is_eui64() {
        let lla = link_local(0xfa163e940598);
        assert_eq!(lla.to_string(), "fe80::f816:3eff:fe94:598");
    }
}
