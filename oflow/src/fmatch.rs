// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The canonical match representation.
//!
//! A [`Match`] is a set of `(field, value, mask)` constraints kept in a
//! `BTreeMap` so that two matches with the same constraints compare and
//! hash identically regardless of insertion order. The desired flow table
//! is content-addressed on this property.

use crate::field::Mff;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A single field constraint: the packet field ANDed with `mask` must
/// equal `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchValue {
    pub value: u128,
    pub mask: u128,
}

/// An OpenFlow match, canonically ordered by field id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Match(BTreeMap<Mff, MatchValue>);

impl Match {
    /// An empty (catch-all) match.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain `field` to exactly `value` (full field mask).
    pub fn set(&mut self, field: Mff, value: u128) {
        self.set_masked(field, value, field.full_mask());
    }

    /// Constrain the bits of `field` selected by `mask` to `value`.
    ///
    /// A later call for the same field widens the existing constraint:
    /// the masks are ORed and the values merged. Callers that need to
    /// detect contradictions do so before getting here.
    pub fn set_masked(&mut self, field: Mff, value: u128, mask: u128) {
        if mask == 0 {
            return;
        }
        let value = value & mask;
        let entry = self
            .0
            .entry(field)
            .or_insert(MatchValue { value: 0, mask: 0 });
        entry.value = (entry.value & !mask) | value;
        entry.mask |= mask;
    }

    /// Remove any constraint on `field`.
    pub fn clear(&mut self, field: Mff) {
        self.0.remove(&field);
    }

    /// The constraint on `field`, if any.
    #[must_use]
    pub fn get(&self, field: Mff) -> Option<MatchValue> {
        self.0.get(&field).copied()
    }

    /// Whether the two constraints on the same fields disagree.
    #[must_use]
    pub fn conflicts(&self, field: Mff, value: u128, mask: u128) -> bool {
        match self.0.get(&field) {
            Some(mv) => (mv.value ^ value) & (mv.mask & mask) != 0,
            None => false,
        }
    }

    /// Number of constrained fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no field is constrained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the constraints in canonical field order.
    pub fn iter(&self) -> impl Iterator<Item = (Mff, MatchValue)> + '_ {
        self.0.iter().map(|(f, v)| (*f, *v))
    }

    /// Rough in-memory footprint, used for cache budgeting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.0.len() * (std::mem::size_of::<Mff>() + std::mem::size_of::<MatchValue>())
    }

    // Typed convenience setters, mirroring the fields the generators use.

    pub fn set_metadata(&mut self, tunnel_key: u64) {
        self.set(Mff::Metadata, u128::from(tunnel_key));
    }

    pub fn set_reg(&mut self, reg: Mff, value: u32) {
        self.set(reg, u128::from(value));
    }

    pub fn set_eth_type(&mut self, eth_type: u16) {
        self.set(Mff::EthType, u128::from(eth_type));
    }

    pub fn set_nw_src(&mut self, addr: Ipv4Addr) {
        self.set(Mff::Ipv4Src, u128::from(u32::from(addr)));
    }

    pub fn set_nw_src_masked(&mut self, addr: Ipv4Addr, mask: Ipv4Addr) {
        self.set_masked(
            Mff::Ipv4Src,
            u128::from(u32::from(addr)),
            u128::from(u32::from(mask)),
        );
    }

    pub fn set_nw_dst(&mut self, addr: Ipv4Addr) {
        self.set(Mff::Ipv4Dst, u128::from(u32::from(addr)));
    }

    pub fn set_nw_dst_masked(&mut self, addr: Ipv4Addr, mask: Ipv4Addr) {
        self.set_masked(
            Mff::Ipv4Dst,
            u128::from(u32::from(addr)),
            u128::from(u32::from(mask)),
        );
    }

    pub fn set_ipv6_src(&mut self, addr: Ipv6Addr) {
        self.set(Mff::Ipv6Src, u128::from(addr));
    }

    pub fn set_ipv6_src_masked(&mut self, addr: Ipv6Addr, mask: Ipv6Addr) {
        self.set_masked(Mff::Ipv6Src, u128::from(addr), u128::from(mask));
    }

    pub fn set_ipv6_dst(&mut self, addr: Ipv6Addr) {
        self.set(Mff::Ipv6Dst, u128::from(addr));
    }

    pub fn set_ipv6_dst_masked(&mut self, addr: Ipv6Addr, mask: Ipv6Addr) {
        self.set_masked(Mff::Ipv6Dst, u128::from(addr), u128::from(mask));
    }

    pub fn set_dl_src(&mut self, mac: u64) {
        self.set(Mff::EthSrc, u128::from(mac));
    }

    pub fn set_dl_dst(&mut self, mac: u64) {
        self.set(Mff::EthDst, u128::from(mac));
    }

    pub fn set_nw_proto(&mut self, proto: u8) {
        self.set(Mff::IpProto, u128::from(proto));
    }

    pub fn set_conj_id(&mut self, id: u32) {
        self.set(Mff::ConjId, u128::from(id));
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "catchall");
        }
        let mut first = true;
        for (field, mv) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if mv.mask == field.full_mask() {
                write!(f, "{field:?}={:#x}", mv.value)?;
            } else {
                write!(f, "{field:?}={:#x}/{:#x}", mv.value, mv.mask)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_irrelevant() {
        let mut a = Match::new();
        a.set_metadata(7);
        a.set_eth_type(0x0800);
        let mut b = Match::new();
        b.set_eth_type(0x0800);
        b.set_metadata(7);
        assert_eq!(a, b);
    }

    #[test]
    fn masked_set_merges_bits() {
        let mut m = Match::new();
        m.set_masked(Mff::Reg10, 1 << 6, 1 << 6);
        m.set_masked(Mff::Reg10, 0, 1 << 12);
        let mv = m.get(Mff::Reg10).unwrap();
        assert_eq!(mv.value, 1 << 6);
        assert_eq!(mv.mask, (1 << 6) | (1 << 12));
    }

    #[test]
    fn conflict_detection() {
        let mut m = Match::new();
        m.set(Mff::Ipv4Src, 0x0a000001);
        assert!(m.conflicts(Mff::Ipv4Src, 0x0a000002, Mff::Ipv4Src.full_mask()));
        assert!(!m.conflicts(Mff::Ipv4Src, 0x0a000001, Mff::Ipv4Src.full_mask()));
        assert!(!m.conflicts(Mff::Ipv4Dst, 0, u128::MAX));
    }

    #[test]
    fn display_is_stable() {
        let mut m = Match::new();
        m.set_eth_type(0x0800);
        m.set_metadata(7);
        assert_eq!(m.to_string(), "Metadata=0x7,EthType=0x800");
    }
}
