// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Encoded OpenFlow actions.
//!
//! [`OfAction`] is the tagged union the action encoder produces and the
//! flow writer consumes. Consumers pattern-match over the variants; there
//! is no dispatch indirection anywhere in between.

use crate::field::Mff;
use std::net::IpAddr;

/// One encoded OpenFlow action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OfAction {
    /// Load an immediate value into (part of) a field.
    SetField {
        field: Mff,
        ofs: u8,
        n_bits: u8,
        value: u128,
    },
    /// Resubmit to another table.
    Resubmit { table: u8 },
    /// Member of an OpenFlow conjunction.
    Conjunction {
        id: u32,
        clause: u8,
        n_clauses: u8,
    },
    /// Conntrack, optionally committing and NATing.
    Ct {
        commit: bool,
        /// Register holding the zone id.
        zone_src: Mff,
        /// Table to recirculate to, `None` for no recirculation.
        recirc_table: Option<u8>,
        nat: Option<NatAction>,
    },
    /// Install a flow when a packet hits this one.
    Learn(LearnAction),
    /// Punt to the controller, with an optional rate-limit meter.
    Controller {
        meter_id: Option<u32>,
        userdata: Vec<u8>,
    },
    /// Apply an OpenFlow group.
    Group { id: u32 },
    /// Output to a concrete OpenFlow port (tunnel ofport).
    Output { port: u32 },
}

/// The NAT part of a [`OfAction::Ct`] action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatAction {
    /// Source NAT when true, destination NAT otherwise.
    pub src: bool,
    /// Address to translate to; `None` NATs to the packet's own address
    /// (used to recover an existing binding).
    pub addr: Option<IpAddr>,
}

/// A `learn` action: the template of the flow to plant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LearnAction {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u32,
    /// Learned flows are deleted together with this flow.
    pub delete_learned: bool,
    pub specs: Vec<LearnSpec>,
}

/// One element of a learn template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LearnSpec {
    /// Learned flow matches `dst` against the value of `src` in the
    /// triggering packet.
    MatchField { dst: Mff, src: Mff },
    /// Learned flow matches `field` against an immediate value.
    MatchImmediate { field: Mff, value: u128 },
    /// Learned flow loads an immediate into (part of) a field.
    Load {
        field: Mff,
        ofs: u8,
        n_bits: u8,
        value: u128,
    },
}

impl OfAction {
    /// Convenience constructor for a single-bit flag load into a field.
    #[must_use]
    pub fn load_bit(field: Mff, bit: u8, value: bool) -> Self {
        OfAction::SetField {
            field,
            ofs: bit,
            n_bits: 1,
            value: u128::from(value),
        }
    }

    /// Convenience constructor for a whole-field load.
    #[must_use]
    pub fn load(field: Mff, value: u128) -> Self {
        OfAction::SetField {
            field,
            ofs: 0,
            n_bits: field.n_bits() as u8,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_bit_shapes() {
        let a = OfAction::load_bit(Mff::Reg10, 12, true);
        assert_eq!(
            a,
            OfAction::SetField {
                field: Mff::Reg10,
                ofs: 12,
                n_bits: 1,
                value: 1
            }
        );
    }

    #[test]
    fn whole_field_load_uses_field_width() {
        let a = OfAction::load(Mff::EthDst, 0xffff_ffff_ffff);
        match a {
            OfAction::SetField { n_bits, .. } => assert_eq!(n_bits, 48),
            _ => unreachable!(),
        }
    }
}
