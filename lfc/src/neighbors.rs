// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! MAC-binding and FDB flow generation.
//!
//! Learned and static neighbor entries become two flows each: one that
//! resolves the outport's next-hop MAC (`MAC_BINDING`) and one that
//! tells the pipeline the sender is already known (`MAC_LOOKUP`).
//! FDB rows likewise produce a destination lookup (`GET_FDB`) and a
//! source check (`LOOKUP_FDB`).

use crate::view::{ChassisCtx, SbView};
use oflow::{FlowSink, Match, Mff, Mlf, OfAction};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::warn;
use uuid::Uuid;

/// Parse `aa:bb:cc:dd:ee:ff` into the 48-bit value.
pub(crate) fn parse_mac(text: &str) -> Option<u64> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut value = 0u64;
    for part in parts {
        if part.len() != 2 {
            return None;
        }
        value = (value << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
    }
    Some(value)
}

/// The row fields a neighbor flow is generated from, common to learned
/// and static MAC bindings.
pub(crate) struct NeighborSource<'a> {
    pub uuid: Uuid,
    pub logical_port: &'a str,
    pub ip: &'a str,
    pub mac: &'a str,
    pub priority: u16,
}

/// Emit the MAC_BINDING/MAC_LOOKUP flow pair for one neighbor row.
pub(crate) fn consider_neighbor_flow<S: FlowSink>(
    src: &NeighborSource<'_>,
    view: &SbView,
    ctx: &ChassisCtx,
    sink: &mut S,
) {
    let Some(pb) = view.pb_by_name(src.logical_port) else {
        return;
    };
    let Some(dp) = view.datapaths.get(&pb.datapath) else {
        return;
    };
    if ctx.local_datapath(dp.tunnel_key).is_none() {
        return;
    }

    let Some(mac) = parse_mac(src.mac) else {
        warn!("bad 'mac' {}", src.mac);
        return;
    };

    let mut get_arp = Match::new();
    let mut lookup_arp = Match::new();
    if src.ip.contains('.') {
        let Ok(ip) = src.ip.parse::<Ipv4Addr>() else {
            warn!("bad 'ip' {}", src.ip);
            return;
        };
        get_arp.set_reg(Mff::Reg0, u32::from(ip));
        lookup_arp.set_reg(Mff::Reg0, u32::from(ip));
        lookup_arp.set_eth_type(0x0806);
    } else {
        let Ok(ip6) = src.ip.parse::<Ipv6Addr>() else {
            warn!("bad 'ip' {}", src.ip);
            return;
        };
        get_arp.set(Mff::XxReg0, u128::from(ip6));
        lookup_arp.set(Mff::XxReg0, u128::from(ip6));
        lookup_arp.set_eth_type(0x86dd);
        lookup_arp.set_nw_proto(58);
        lookup_arp.set(Mff::IcmpCode, 0);
    }

    get_arp.set_metadata(dp.tunnel_key);
    get_arp.set_reg(Mff::LOG_OUTPORT, pb.tunnel_key as u32);
    sink.add_flow(
        ctx.tables.mac_binding,
        src.priority,
        get_arp,
        vec![
            OfAction::load(Mff::EthDst, u128::from(mac)),
            OfAction::load_bit(Mff::LOG_FLAGS, Mlf::LookupMac.bit(), true),
        ],
        src.uuid,
    );

    lookup_arp.set_metadata(dp.tunnel_key);
    lookup_arp.set_reg(Mff::LOG_INPORT, pb.tunnel_key as u32);
    lookup_arp.set_dl_src(mac);
    sink.add_flow(
        ctx.tables.mac_lookup,
        src.priority,
        lookup_arp,
        vec![OfAction::load_bit(Mff::LOG_FLAGS, Mlf::LookupMac.bit(), true)],
        src.uuid,
    );
}

/// Emit neighbor flows for every MAC binding in the view.
pub(crate) fn add_neighbor_flows<S: FlowSink>(view: &SbView, ctx: &ChassisCtx, sink: &mut S) {
    for mb in view.mac_bindings.iter() {
        consider_neighbor_flow(
            &NeighborSource {
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
    for smb in view.static_mac_bindings.iter() {
        consider_neighbor_flow(
            &NeighborSource {
                uuid: smb.uuid,
                logical_port: &smb.logical_port,
                ip: &smb.ip,
                mac: &smb.mac,
                priority: static_mac_priority(smb.override_dynamic_mac),
            },
            view,
            ctx,
            sink,
        );
    }
}

/// Static bindings outrank learned ones only when asked to.
pub(crate) fn static_mac_priority(override_dynamic_mac: bool) -> u16 {
    if override_dynamic_mac {
        150
    } else {
        50
    }
}

/// Emit the GET_FDB/LOOKUP_FDB flow pair for one FDB row.
pub(crate) fn consider_fdb_flows<S: FlowSink>(
    fdb: &crate::view::FdbRow,
    ctx: &ChassisCtx,
    sink: &mut S,
) {
    if ctx.local_datapath(fdb.dp_key).is_none() {
        return;
    }
    let Some(mac) = parse_mac(&fdb.mac) else {
        warn!("bad 'mac' {}", fdb.mac);
        return;
    };

    let mut get = Match::new();
    get.set_metadata(fdb.dp_key);
    get.set_dl_dst(mac);
    sink.add_flow(
        ctx.tables.get_fdb,
        100,
        get,
        vec![OfAction::load(Mff::LOG_OUTPORT, u128::from(fdb.port_key))],
        fdb.uuid,
    );

    let mut lookup = Match::new();
    lookup.set_metadata(fdb.dp_key);
    lookup.set_dl_src(mac);
    lookup.set_reg(Mff::LOG_INPORT, fdb.port_key as u32);
    sink.add_flow(
        ctx.tables.lookup_fdb,
        100,
        lookup,
        vec![OfAction::load_bit(Mff::LOG_FLAGS, Mlf::LookupFdb.bit(), true)],
        fdb.uuid,
    );
}

/// Emit FDB flows for every row in the view.
pub(crate) fn add_fdb_flows<S: FlowSink>(view: &SbView, ctx: &ChassisCtx, sink: &mut S) {
    for fdb in view.fdbs.iter() {
        consider_fdb_flows(fdb, ctx, sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(parse_mac("00:00:00:00:00:01"), Some(1));
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff"), Some(0xaabbccddeeff));
        assert_eq!(parse_mac("not-a-mac"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
    }

    #[test]
    fn static_priorities() {
        assert_eq!(static_mac_priority(true), 150);
        assert_eq!(static_mac_priority(false), 50);
    }
}
