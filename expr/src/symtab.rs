// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The symbol table of predefined match fields and predicates.
//!
//! Built once at engine construction and handed around explicitly; there
//! is no ambient table.

use ahash::RandomState;
use oflow::field::cs;
use oflow::Mff;
use std::collections::HashMap;

/// What a symbol resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A whole match field.
    Field { mff: Mff, maskable: bool },
    /// A bit range inside a match field (conntrack state bits and the
    /// like).
    Subfield { mff: Mff, ofs: u32, n_bits: u32 },
    /// A field whose constants are logical port names, resolved to port
    /// keys when matches are generated.
    StringField { mff: Mff },
    /// A named boolean that expands to an expression over other symbols.
    Predicate { expansion: &'static str },
}

/// One symbol: its kind plus the prerequisite every comparison on it
/// drags in (`tcp.dst` requires `tcp`, which requires `ip`, ...).
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub prereq: Option<&'static str>,
}

/// Name → symbol map for the logical pipeline fields.
pub struct Symtab {
    symbols: HashMap<String, Symbol, RandomState>,
}

impl Symtab {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    fn add(&mut self, name: &'static str, kind: SymbolKind, prereq: Option<&'static str>) {
        self.symbols.insert(name.to_string(), Symbol { kind, prereq });
    }

    fn add_field(&mut self, name: &'static str, mff: Mff, maskable: bool,
                 prereq: Option<&'static str>) {
        self.add(name, SymbolKind::Field { mff, maskable }, prereq);
    }

    fn add_predicate(&mut self, name: &'static str, expansion: &'static str) {
        self.add(name, SymbolKind::Predicate { expansion }, None);
    }

    fn add_ct_bit(&mut self, name: &'static str, bit: u32) {
        self.add(
            name,
            SymbolKind::Subfield {
                mff: Mff::CtState,
                ofs: bit,
                n_bits: 1,
            },
            Some("ct.trk"),
        );
    }

    /// Build the table of fields the logical pipeline exposes.
    #[must_use]
    pub fn new() -> Self {
        let mut t = Self {
            symbols: HashMap::with_hasher(RandomState::with_seed(0)),
        };

        // Ethernet.
        t.add_field("eth.src", Mff::EthSrc, true, None);
        t.add_field("eth.dst", Mff::EthDst, true, None);
        t.add_field("eth.type", Mff::EthType, false, None);

        // Logical pipeline registers.
        t.add_field("reg0", Mff::Reg0, true, None);
        t.add_field("reg1", Mff::Reg1, true, None);
        t.add_field("reg2", Mff::Reg2, true, None);
        t.add_field("reg3", Mff::Reg3, true, None);
        t.add_field("reg4", Mff::Reg4, true, None);
        t.add_field("reg5", Mff::Reg5, true, None);
        t.add_field("reg6", Mff::Reg6, true, None);
        t.add_field("reg7", Mff::Reg7, true, None);
        t.add_field("reg8", Mff::Reg8, true, None);
        t.add_field("reg9", Mff::Reg9, true, None);
        t.add_field("xxreg0", Mff::XxReg0, true, None);
        t.add("inport", SymbolKind::StringField { mff: Mff::LOG_INPORT }, None);
        t.add("outport", SymbolKind::StringField { mff: Mff::LOG_OUTPORT }, None);

        // IP.
        t.add_predicate("ip", "eth.type == 0x800 || eth.type == 0x86dd");
        t.add_predicate("ip4", "eth.type == 0x800");
        t.add_predicate("ip6", "eth.type == 0x86dd");
        t.add_field("ip.proto", Mff::IpProto, false, Some("ip"));
        t.add_field("ip.ttl", Mff::NwTtl, false, Some("ip"));
        t.add_field("ip4.src", Mff::Ipv4Src, true, Some("ip4"));
        t.add_field("ip4.dst", Mff::Ipv4Dst, true, Some("ip4"));
        t.add_field("ip6.src", Mff::Ipv6Src, true, Some("ip6"));
        t.add_field("ip6.dst", Mff::Ipv6Dst, true, Some("ip6"));

        // ICMP.
        t.add_predicate("icmp4", "ip4 && ip.proto == 1");
        t.add_predicate("icmp6", "ip6 && ip.proto == 58");
        t.add_predicate("icmp", "icmp4 || icmp6");
        t.add_field("icmp4.type", Mff::IcmpType, false, Some("icmp4"));
        t.add_field("icmp4.code", Mff::IcmpCode, false, Some("icmp4"));
        t.add_field("icmp6.type", Mff::IcmpType, false, Some("icmp6"));
        t.add_field("icmp6.code", Mff::IcmpCode, false, Some("icmp6"));

        // ARP / ND.
        t.add_predicate("arp", "eth.type == 0x806");
        t.add_field("arp.op", Mff::ArpOp, false, Some("arp"));
        t.add_field("arp.spa", Mff::ArpSpa, true, Some("arp"));
        t.add_field("arp.tpa", Mff::ArpTpa, true, Some("arp"));
        t.add_field("arp.sha", Mff::ArpSha, false, Some("arp"));
        t.add_field("arp.tha", Mff::ArpTha, false, Some("arp"));
        t.add_predicate("nd_ns", "icmp6.type == 135 && icmp6.code == 0 && ip.ttl == 255");
        t.add_predicate("nd_na", "icmp6.type == 136 && icmp6.code == 0 && ip.ttl == 255");
        t.add_predicate("nd", "nd_ns || nd_na");
        t.add_field("nd.target", Mff::NdTarget, true, Some("nd"));
        t.add_field("nd.sll", Mff::ArpSha, false, Some("nd_ns"));
        t.add_field("nd.tll", Mff::ArpTha, false, Some("nd_na"));

        // L4.
        t.add_predicate("tcp", "ip.proto == 6");
        t.add_predicate("udp", "ip.proto == 17");
        t.add_predicate("sctp", "ip.proto == 132");
        t.add_field("tcp.src", Mff::TcpSrc, true, Some("tcp"));
        t.add_field("tcp.dst", Mff::TcpDst, true, Some("tcp"));
        t.add_field("udp.src", Mff::UdpSrc, true, Some("udp"));
        t.add_field("udp.dst", Mff::UdpDst, true, Some("udp"));
        t.add_field("sctp.src", Mff::SctpSrc, true, Some("sctp"));
        t.add_field("sctp.dst", Mff::SctpDst, true, Some("sctp"));

        // Conntrack.
        t.add("ct.trk", SymbolKind::Subfield { mff: Mff::CtState, ofs: 5, n_bits: 1 }, None);
        t.add_ct_bit("ct.new", cs::NEW.trailing_zeros());
        t.add_ct_bit("ct.est", cs::EST.trailing_zeros());
        t.add_ct_bit("ct.rel", cs::REL.trailing_zeros());
        t.add_ct_bit("ct.rpl", cs::RPL.trailing_zeros());
        t.add_ct_bit("ct.inv", cs::INV.trailing_zeros());
        t.add_ct_bit("ct.dnat", cs::DNAT.trailing_zeros());
        t.add_ct_bit("ct.snat", cs::SNAT.trailing_zeros());
        t.add(
            "ct_mark.natted",
            SymbolKind::Subfield { mff: Mff::CtMark, ofs: 0, n_bits: 1 },
            Some("ct.trk"),
        );
        t.add(
            "ct.natted",
            SymbolKind::Subfield { mff: Mff::CtMark, ofs: 0, n_bits: 1 },
            Some("ct.trk"),
        );

        t
    }
}

impl Default for Symtab {
    fn default() -> Self {
        Self::new()
    }
}
