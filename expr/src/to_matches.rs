// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rendering normalized terms into OpenFlow matches.
//!
//! Port names are resolved through the caller's lookup callback at this
//! stage; an unresolvable name silently drops the candidate match (the
//! callback records the reference so the flow is reprocessed when the
//! port appears). Conjunction ids are numbered relative to the flow,
//! starting at 1; [`matches_prepare`] rebases them onto the range the
//! allocator granted.

use crate::ast::{Cmp, CmpValue, Relop};
use crate::normalize::{Normalized, Term};
use oflow::{AsInfo, Conjunction, Match, Mff};
use std::collections::BTreeMap;
use tracing::debug;

/// One generated match with its conjunction memberships and address-set
/// provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprMatch {
    pub fmatch: Match,
    pub conjunctions: Vec<Conjunction>,
    pub as_info: Option<AsInfo>,
}

impl ExprMatch {
    /// Rough in-memory footprint, used for cache budgeting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.fmatch.size_bytes()
            + self.conjunctions.len() * std::mem::size_of::<Conjunction>()
            + self
                .as_info
                .as_ref()
                .map_or(0, |i| std::mem::size_of::<AsInfo>() + i.name.len())
    }
}

/// Callback resolving a logical port name to its port key on the current
/// datapath.
pub type LookupPort<'a> = dyn FnMut(&str) -> Option<u64> + 'a;

/// Render `normalized` into matches. Returns the matches and the number
/// of conjunctions used (with relative ids `1..=n_conjs`).
pub fn to_matches(normalized: &Normalized, lookup_port: &mut LookupPort<'_>)
    -> (Vec<ExprMatch>, u32) {
    let mut out: BTreeMap<Match, ExprMatch> = BTreeMap::new();
    let mut n_conjs = 0u32;

    for term in &normalized.terms {
        render_term(term, lookup_port, &mut out, &mut n_conjs);
    }

    (out.into_values().collect(), n_conjs)
}

fn render_term(
    term: &Term,
    lookup_port: &mut LookupPort<'_>,
    out: &mut BTreeMap<Match, ExprMatch>,
    n_conjs: &mut u32,
) {
    let mut base = Match::new();
    let mut base_tag = None;
    for cmp in &term.cmps {
        match apply_cmp(&mut base, cmp, lookup_port) {
            Applied::Ok(tag) => {
                if tag.is_some() {
                    base_tag = tag;
                }
            }
            Applied::Dead => return,
        }
    }

    match term.dims.len() {
        0 => {
            add_match(out, base, Vec::new(), base_tag);
        }
        1 => {
            for member in &term.dims[0] {
                let mut m = base.clone();
                match apply_cmp(&mut m, member, lookup_port) {
                    Applied::Ok(tag) => {
                        add_match(out, m, Vec::new(), tag.or_else(|| base_tag.clone()));
                    }
                    Applied::Dead => {}
                }
            }
        }
        n_clauses => {
            *n_conjs += 1;
            let id = *n_conjs;
            let n_clauses = n_clauses as u8;
            for (clause, dim) in term.dims.iter().enumerate() {
                for member in dim {
                    let mut m = base.clone();
                    match apply_cmp(&mut m, member, lookup_port) {
                        Applied::Ok(tag) => {
                            let conj = Conjunction {
                                id,
                                clause: clause as u8,
                                n_clauses,
                            };
                            add_match(out, m, vec![conj], tag.or_else(|| base_tag.clone()));
                        }
                        Applied::Dead => {}
                    }
                }
            }
            // The flow that fires once every clause has matched.
            let mut conj_match = Match::new();
            conj_match.set_conj_id(id);
            add_match(out, conj_match, Vec::new(), None);
        }
    }
}

enum Applied {
    Ok(Option<AsInfo>),
    Dead,
}

fn apply_cmp(m: &mut Match, cmp: &Cmp, lookup_port: &mut LookupPort<'_>) -> Applied {
    match &cmp.value {
        CmpValue::Int { value, mask } => {
            debug_assert_eq!(cmp.relop, Relop::Eq);
            let value = value << cmp.field.ofs;
            let mask = mask << cmp.field.ofs;
            if m.conflicts(cmp.field.mff, value, mask) {
                return Applied::Dead;
            }
            m.set_masked(cmp.field.mff, value, mask);
            Applied::Ok(cmp.as_tag.clone())
        }
        CmpValue::Str(name) => {
            if cmp.relop != Relop::Eq {
                debug!("dropping match with negated port comparison");
                return Applied::Dead;
            }
            let Some(key) = lookup_port(name) else {
                return Applied::Dead;
            };
            let value = u128::from(key);
            let mask = cmp.field.mff.full_mask();
            if m.conflicts(cmp.field.mff, value, mask) {
                return Applied::Dead;
            }
            m.set_masked(cmp.field.mff, value, mask);
            Applied::Ok(None)
        }
    }
}

fn add_match(
    out: &mut BTreeMap<Match, ExprMatch>,
    fmatch: Match,
    conjunctions: Vec<Conjunction>,
    as_info: Option<AsInfo>,
) {
    if let Some(existing) = out.get_mut(&fmatch) {
        for conj in conjunctions {
            if !existing.conjunctions.contains(&conj) {
                existing.conjunctions.push(conj);
            }
        }
        if existing.as_info.is_none() {
            existing.as_info = as_info;
        }
    } else {
        out.insert(
            fmatch.clone(),
            ExprMatch {
                fmatch,
                conjunctions,
                as_info,
            },
        );
    }
}

/// Rebase relative conjunction ids by `offset` (the allocator's first
/// id minus one).
pub fn matches_prepare(matches: &mut [ExprMatch], offset: u32) {
    if offset == 0 {
        return;
    }
    for m in matches.iter_mut() {
        for conj in &mut m.conjunctions {
            conj.id += offset;
        }
        if let Some(mv) = m.fmatch.get(Mff::ConjId) {
            m.fmatch.set(Mff::ConjId, mv.value + u128::from(offset));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AddrSets, Const, ConstFormat, ConstSet, PortGroups};
    use crate::normalize::{evaluate_condition, normalize, simplify};
    use crate::parse::parse_match;
    use crate::symtab::Symtab;
    use ahash::RandomState;
    use std::collections::HashMap;

    fn compile(
        input: &str,
        sets: &HashMap<String, ConstSet, RandomState>,
        lookup: &mut LookupPort<'_>,
    ) -> (Vec<ExprMatch>, u32) {
        let symtab = Symtab::new();
        let addr_sets = AddrSets::new(sets);
        let groups = PortGroups::with_hasher(RandomState::with_seed(0));
        let parsed = parse_match(input, &symtab, &addr_sets, &groups)
            .result
            .expect("parse failed");
        let evaluated = evaluate_condition(simplify(parsed), &mut |_| true);
        to_matches(&normalize(evaluated), lookup)
    }

    fn no_sets() -> HashMap<String, ConstSet, RandomState> {
        HashMap::with_hasher(RandomState::with_seed(0))
    }

    fn v4(a: u32) -> Const {
        Const {
            value: u128::from(a),
            mask: None,
            format: ConstFormat::Ipv4,
        }
    }

    #[test]
    fn exact_match_single_flow() {
        let (matches, n_conjs) = compile("ip4.dst == 10.0.0.1", &no_sets(), &mut |_| None);
        assert_eq!(n_conjs, 0);
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.fmatch.get(Mff::EthType).map(|v| v.value), Some(0x800));
        assert_eq!(
            m.fmatch.get(Mff::Ipv4Dst).map(|v| v.value),
            Some(0x0a000001)
        );
        assert!(m.conjunctions.is_empty());
    }

    #[test]
    fn address_set_expands_without_conjunction() {
        let mut sets = no_sets();
        sets.insert(
            "s".into(),
            ConstSet(vec![v4(0x01010101), v4(0x02020202), v4(0x03030303)]),
        );
        let (matches, n_conjs) = compile("ip4.src == $s", &sets, &mut |_| None);
        assert_eq!(n_conjs, 0);
        assert_eq!(matches.len(), 3);
        for m in &matches {
            let info = m.as_info.as_ref().expect("missing provenance tag");
            assert_eq!(info.name, "s");
            assert_eq!(info.mask, 0xffff_ffff);
            assert!(m.conjunctions.is_empty());
        }
    }

    #[test]
    fn cross_product_uses_one_conjunction() {
        let mut sets = no_sets();
        sets.insert("a".into(), ConstSet(vec![v4(0x01010101), v4(0x02020202)]));
        sets.insert("b".into(), ConstSet(vec![v4(0x03030303), v4(0x04040404)]));
        let (matches, n_conjs) = compile("ip4.src == $a && ip4.dst == $b", &sets, &mut |_| None);
        assert_eq!(n_conjs, 1);
        // Four clause flows plus the conj-id flow.
        assert_eq!(matches.len(), 5);
        let clauses: Vec<&ExprMatch> =
            matches.iter().filter(|m| !m.conjunctions.is_empty()).collect();
        assert_eq!(clauses.len(), 4);
        for c in &clauses {
            assert_eq!(c.conjunctions.len(), 1);
            assert_eq!(c.conjunctions[0].n_clauses, 2);
            assert_eq!(c.conjunctions[0].id, 1);
        }
        let conj_flow: Vec<&ExprMatch> =
            matches.iter().filter(|m| m.fmatch.get(Mff::ConjId).is_some()).collect();
        assert_eq!(conj_flow.len(), 1);
    }

    #[test]
    fn unknown_port_drops_match() {
        let (matches, _) = compile(r#"inport == "vm-1""#, &no_sets(), &mut |_| None);
        assert!(matches.is_empty());
        let (matches, _) = compile(r#"inport == "vm-1""#, &no_sets(), &mut |name| {
            (name == "vm-1").then_some(5)
        });
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].fmatch.get(Mff::LOG_INPORT).map(|v| v.value),
            Some(5)
        );
    }

    #[test]
    fn prepare_rebases_conjunction_ids() {
        let mut sets = no_sets();
        sets.insert("a".into(), ConstSet(vec![v4(1), v4(2)]));
        sets.insert("b".into(), ConstSet(vec![v4(3), v4(4)]));
        let (mut matches, n_conjs) =
            compile("ip4.src == $a && ip4.dst == $b", &sets, &mut |_| None);
        assert_eq!(n_conjs, 1);
        matches_prepare(&mut matches, 41);
        for m in &matches {
            for c in &m.conjunctions {
                assert_eq!(c.id, 42);
            }
            if let Some(mv) = m.fmatch.get(Mff::ConjId) {
                assert_eq!(mv.value, 42);
            }
        }
    }
}
