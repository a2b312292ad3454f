// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Expression tree and constant types.

use ahash::RandomState;
use oflow::{AsInfo, Mff};
use std::collections::HashMap;

/// How a constant was written; drives mask defaulting and address-set
/// provenance tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstFormat {
    Decimal,
    Hex,
    Ipv4,
    Ipv6,
    Ethernet,
}

/// One literal constant, with an optional mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Const {
    pub value: u128,
    pub mask: Option<u128>,
    pub format: ConstFormat,
}

impl Const {
    /// The width, in bits, implied by the constant's format, when it has
    /// one (addresses do, plain integers do not).
    #[must_use]
    pub fn format_bits(&self) -> Option<u32> {
        match self.format {
            ConstFormat::Ipv4 => Some(32),
            ConstFormat::Ipv6 => Some(128),
            ConstFormat::Ethernet => Some(48),
            ConstFormat::Decimal | ConstFormat::Hex => None,
        }
    }

    /// The mask to record in an address-set provenance tag: the written
    /// mask, or the full width of the address format.
    #[must_use]
    pub fn as_tag_mask(&self) -> Option<u128> {
        if let Some(mask) = self.mask {
            return Some(mask);
        }
        self.format_bits().map(|bits| {
            if bits == 128 {
                u128::MAX
            } else {
                (1u128 << bits) - 1
            }
        })
    }
}

/// A named set of constants (the value of an address set).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstSet(pub Vec<Const>);

impl ConstSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The map of address sets visible to the parser, with an optional
/// override used by the incremental address-set path to substitute one
/// set with a small stand-in without mutating the shared map.
pub struct AddrSets<'a> {
    base: &'a HashMap<String, ConstSet, RandomState>,
    overlay: Option<(&'a str, &'a ConstSet)>,
}

impl<'a> AddrSets<'a> {
    #[must_use]
    pub fn new(base: &'a HashMap<String, ConstSet, RandomState>) -> Self {
        Self {
            base,
            overlay: None,
        }
    }

    /// Like [`AddrSets::new`], but `name` resolves to `set` instead of
    /// its entry in the base map.
    #[must_use]
    pub fn with_overlay(
        base: &'a HashMap<String, ConstSet, RandomState>,
        name: &'a str,
        set: &'a ConstSet,
    ) -> Self {
        Self {
            base,
            overlay: Some((name, set)),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'a ConstSet> {
        if let Some((oname, oset)) = self.overlay {
            if oname == name {
                return Some(oset);
            }
        }
        self.base.get(name)
    }
}

/// Port groups: name to member logical port names.
pub type PortGroups = HashMap<String, Vec<String>, RandomState>;

/// Relational operator of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relop {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relop {
    /// The operator satisfied exactly when `self` is not.
    #[must_use]
    pub fn negated(self) -> Relop {
        match self {
            Relop::Eq => Relop::Ne,
            Relop::Ne => Relop::Eq,
            Relop::Lt => Relop::Ge,
            Relop::Ge => Relop::Lt,
            Relop::Gt => Relop::Le,
            Relop::Le => Relop::Gt,
        }
    }
}

/// A resolved reference to (part of) a match field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub mff: Mff,
    /// Bit offset inside the field (nonzero for subfields like ct bits).
    pub ofs: u32,
    pub n_bits: u32,
}

impl FieldRef {
    /// Mask of the referenced bits, in subfield coordinates.
    #[must_use]
    pub fn width_mask(&self) -> u128 {
        if self.n_bits == 128 {
            u128::MAX
        } else {
            (1u128 << self.n_bits) - 1
        }
    }
}

/// The right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmpValue {
    /// Integer constant in subfield coordinates, with a concrete mask.
    Int { value: u128, mask: u128 },
    /// A logical port name, resolved to a port key at match time.
    Str(String),
}

/// An atomic comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Cmp {
    pub field: FieldRef,
    pub relop: Relop,
    pub value: CmpValue,
    /// Present when the constant came from `field == $set`; carries the
    /// set name and the member address for incremental maintenance.
    pub as_tag: Option<AsInfo>,
}

/// A chassis-local predicate, resolved by the engine per evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    ChassisResident(String),
}

/// The expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Cmp(Cmp),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Condition(Condition),
}

impl Expr {
    /// Rough in-memory footprint of the tree, used for cache budgeting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let own = std::mem::size_of::<Expr>();
        match self {
            Expr::Bool(_) | Expr::Condition(_) => own,
            Expr::Cmp(cmp) => {
                own + match &cmp.value {
                    CmpValue::Str(s) => s.len(),
                    CmpValue::Int { .. } => 0,
                }
            }
            Expr::Not(sub) => own + sub.size_bytes(),
            Expr::And(subs) | Expr::Or(subs) => {
                own + subs.iter().map(Expr::size_bytes).sum::<usize>()
            }
        }
    }
}
