// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Simplification, condition evaluation and normalization.
//!
//! Normal form is a disjunction of [`Term`]s. A term is a conjunction of
//! exact comparisons (`cmps`) and disjunctive dimensions (`dims`), each
//! dimension being the surviving member set of an `==`-against-set
//! comparison. Terms with two or more dimensions become OpenFlow
//! conjunctions downstream; a single dimension is expanded instead.

use crate::ast::{Cmp, CmpValue, Condition, Expr, FieldRef, Relop};
use tracing::debug;

/// Fold constants, flatten nested connectives and push negation down to
/// the comparisons (`!(a && b)` becomes `!a || !b`, `!(x == c)` becomes
/// `x != c`). Negation stops at chassis predicates, which are resolved
/// later by [`evaluate_condition`].
#[must_use]
pub fn simplify(expr: Expr) -> Expr {
    match expr {
        Expr::Bool(_) | Expr::Cmp(_) | Expr::Condition(_) => expr,
        Expr::Not(sub) => negate(*sub),
        Expr::And(subs) => {
            let mut out = Vec::with_capacity(subs.len());
            for sub in subs {
                match simplify(sub) {
                    Expr::Bool(true) => {}
                    Expr::Bool(false) => return Expr::Bool(false),
                    Expr::And(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            match out.len() {
                0 => Expr::Bool(true),
                1 => out.remove(0),
                _ => Expr::And(out),
            }
        }
        Expr::Or(subs) => {
            let mut out = Vec::with_capacity(subs.len());
            for sub in subs {
                match simplify(sub) {
                    Expr::Bool(false) => {}
                    Expr::Bool(true) => return Expr::Bool(true),
                    Expr::Or(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            match out.len() {
                0 => Expr::Bool(false),
                1 => out.remove(0),
                _ => Expr::Or(out),
            }
        }
    }
}

fn negate(expr: Expr) -> Expr {
    match expr {
        Expr::Bool(b) => Expr::Bool(!b),
        Expr::Cmp(mut cmp) => {
            cmp.relop = cmp.relop.negated();
            cmp.as_tag = None;
            Expr::Cmp(cmp)
        }
        Expr::Not(sub) => simplify(*sub),
        Expr::And(subs) => simplify(Expr::Or(subs.into_iter().map(negate).collect())),
        Expr::Or(subs) => simplify(Expr::And(subs.into_iter().map(negate).collect())),
        Expr::Condition(c) => Expr::Not(Box::new(Expr::Condition(c))),
    }
}

/// Replace every chassis predicate with the boolean the callback
/// produces, then fold the result.
#[must_use]
pub fn evaluate_condition(expr: Expr, cb: &mut dyn FnMut(&Condition) -> bool) -> Expr {
    fn walk(expr: Expr, cb: &mut dyn FnMut(&Condition) -> bool) -> Expr {
        match expr {
            Expr::Condition(c) => Expr::Bool(cb(&c)),
            Expr::Not(sub) => Expr::Not(Box::new(walk(*sub, cb))),
            Expr::And(subs) => Expr::And(subs.into_iter().map(|s| walk(s, cb)).collect()),
            Expr::Or(subs) => Expr::Or(subs.into_iter().map(|s| walk(s, cb)).collect()),
            other => other,
        }
    }
    simplify(walk(expr, cb))
}

/// One conjunctive term of the normal form.
#[derive(Debug, Clone, Default)]
pub struct Term {
    /// Scalar constraints, all exact (`Relop::Eq`).
    pub cmps: Vec<Cmp>,
    /// Disjunctive dimensions; each inner vector has at least two
    /// members.
    pub dims: Vec<Vec<Cmp>>,
}

/// The normalized expression: a disjunction of terms. No terms means the
/// expression is unsatisfiable.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub terms: Vec<Term>,
}

/// Normalize a simplified, condition-free expression.
#[must_use]
pub fn normalize(expr: Expr) -> Normalized {
    Normalized {
        terms: norm(expr),
    }
}

fn norm(expr: Expr) -> Vec<Term> {
    match expr {
        Expr::Bool(true) => vec![Term::default()],
        Expr::Bool(false) => Vec::new(),
        Expr::Cmp(cmp) => {
            let members = expand_cmp(cmp);
            match members.len() {
                0 => Vec::new(),
                1 => vec![Term {
                    cmps: members,
                    dims: Vec::new(),
                }],
                _ => vec![Term {
                    cmps: Vec::new(),
                    dims: vec![members],
                }],
            }
        }
        Expr::Or(subs) => subs.into_iter().flat_map(norm).collect(),
        Expr::And(subs) => {
            let mut result = vec![Term::default()];
            for sub in subs {
                let child = norm(sub);
                if child.is_empty() {
                    return Vec::new();
                }
                if child.len() == 1 {
                    let term = &child[0];
                    result.retain_mut(|r| merge_term(r, term));
                } else if child
                    .iter()
                    .all(|t| t.dims.is_empty() && t.cmps.len() == 1)
                {
                    // A disjunction of plain comparisons survives as one
                    // dimension of every term.
                    let members: Vec<Cmp> = child
                        .into_iter()
                        .filter_map(|mut t| t.cmps.pop())
                        .collect();
                    for r in &mut result {
                        if !r.dims.contains(&members) {
                            r.dims.push(members.clone());
                        }
                    }
                } else {
                    // Mixed children force distribution.
                    let mut next = Vec::new();
                    for r in &result {
                        for t in &child {
                            let mut merged = r.clone();
                            if merge_term(&mut merged, t) {
                                next.push(merged);
                            }
                        }
                    }
                    result = next;
                }
                if result.is_empty() {
                    return Vec::new();
                }
            }
            result
        }
        Expr::Not(_) | Expr::Condition(_) => {
            // Conditions are evaluated before normalization; anything
            // left over cannot match.
            debug!("normalizing an unevaluated condition, treating as false");
            Vec::new()
        }
    }
}

/// Conjoin `src` into `dst`. Returns false when the combined term cannot
/// match anything.
fn merge_term(dst: &mut Term, src: &Term) -> bool {
    for cmp in &src.cmps {
        if !merge_cmp(&mut dst.cmps, cmp) {
            return false;
        }
    }
    // A ∧ A = A: the same disjunction conjoined twice is one dimension.
    for dim in &src.dims {
        if !dst.dims.contains(dim) {
            dst.dims.push(dim.clone());
        }
    }
    true
}

/// Conjoin one exact comparison into a comparison list, combining it
/// with an existing comparison on the same field.
fn merge_cmp(cmps: &mut Vec<Cmp>, new: &Cmp) -> bool {
    let (new_value, new_mask) = match &new.value {
        CmpValue::Int { value, mask } => {
            (value << new.field.ofs, mask << new.field.ofs)
        }
        CmpValue::Str(s) => {
            for existing in cmps.iter() {
                if existing.field.mff != new.field.mff {
                    continue;
                }
                return match &existing.value {
                    CmpValue::Str(e) => e == s,
                    // A port name and a raw register constraint on the
                    // same register cannot be reconciled here.
                    CmpValue::Int { .. } => false,
                };
            }
            cmps.push(new.clone());
            return true;
        }
    };
    for existing in cmps.iter_mut() {
        if existing.field.mff != new.field.mff {
            continue;
        }
        let CmpValue::Int { value, mask } = &existing.value else {
            return false;
        };
        let evalue = value << existing.field.ofs;
        let emask = mask << existing.field.ofs;
        if (evalue ^ new_value) & (emask & new_mask) != 0 {
            return false;
        }
        let merged_mask = emask | new_mask;
        let merged_value = (evalue & emask) | (new_value & new_mask);
        existing.field = FieldRef {
            mff: existing.field.mff,
            ofs: 0,
            n_bits: existing.field.mff.n_bits(),
        };
        existing.value = CmpValue::Int {
            value: merged_value,
            mask: merged_mask,
        };
        if existing.as_tag.is_none() {
            existing.as_tag = new.as_tag.clone();
        }
        return true;
    }
    cmps.push(new.clone());
    true
}

/// Expand a comparison into the exact (`==`) comparisons that cover it.
/// Relational operators become prefix covers, `!=` becomes a per-bit
/// mismatch disjunction. The empty vector means the comparison cannot
/// match.
fn expand_cmp(cmp: Cmp) -> Vec<Cmp> {
    let (value, mask) = match &cmp.value {
        CmpValue::Str(_) => {
            return match cmp.relop {
                Relop::Eq => vec![cmp],
                // A negated port comparison has no match representation;
                // the whole branch is dropped.
                _ => {
                    debug!("dropping unsupported negated port comparison");
                    Vec::new()
                }
            };
        }
        CmpValue::Int { value, mask } => (*value, *mask),
    };
    let field = cmp.field;
    let width = field.n_bits;
    let max = field.width_mask();
    let remake = |value: u128, mask: u128| Cmp {
        field,
        relop: Relop::Eq,
        value: CmpValue::Int { value, mask },
        as_tag: None,
    };
    match cmp.relop {
        Relop::Eq => vec![cmp],
        Relop::Ne => {
            // Match every way a masked bit can disagree.
            let mut out = Vec::new();
            for bit in 0..width {
                let b = 1u128 << bit;
                if mask & b != 0 {
                    out.push(remake(!value & b, b));
                }
            }
            out
        }
        Relop::Lt => lt_patterns(value, width, &remake),
        Relop::Le => {
            if value == max {
                vec![remake(0, 0)]
            } else {
                lt_patterns(value + 1, width, &remake)
            }
        }
        Relop::Gt => gt_patterns(value, width, &remake),
        Relop::Ge => {
            if value == 0 {
                vec![remake(0, 0)]
            } else {
                gt_patterns(value - 1, width, &remake)
            }
        }
    }
}

/// Prefix patterns matching exactly the values below `bound`: one
/// pattern per set bit of the bound, keeping the higher bits and pinning
/// that bit to zero.
fn lt_patterns(bound: u128, width: u32, remake: &impl Fn(u128, u128) -> Cmp) -> Vec<Cmp> {
    let mut out = Vec::new();
    for bit in 0..width {
        let b = 1u128 << bit;
        if bound & b != 0 {
            let low = if bit == 127 { u128::MAX } else { (1u128 << (bit + 1)) - 1 };
            let value = bound & !low;
            let mask = !(low >> 1) & width_mask(width);
            out.push(remake(value, mask));
        }
    }
    out
}

/// Prefix patterns matching exactly the values above `bound`: one
/// pattern per clear bit of the bound, keeping the higher bits and
/// pinning that bit to one.
fn gt_patterns(bound: u128, width: u32, remake: &impl Fn(u128, u128) -> Cmp) -> Vec<Cmp> {
    let mut out = Vec::new();
    for bit in 0..width {
        let b = 1u128 << bit;
        if bound & b == 0 {
            let low = if bit == 127 { u128::MAX } else { (1u128 << (bit + 1)) - 1 };
            let value = (bound & !low) | b;
            let mask = !(low >> 1) & width_mask(width);
            out.push(remake(value, mask));
        }
    }
    out
}

fn width_mask(width: u32) -> u128 {
    if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}
