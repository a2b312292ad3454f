// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The match expression library.
//!
//! Logical flows carry their match as a string in a small expression
//! language over symbolic fields (`ip4.src == {10.0.0.1, $allowed}`),
//! address sets, port groups and chassis predicates. This crate turns
//! such a string into OpenFlow matches:
//!
//! 1. [`parse`](parse::parse_match) resolves symbols against the
//!    [`Symtab`], expands address sets and port groups, attaches field
//!    prerequisites and reports the external names the expression
//!    depends on;
//! 2. [`simplify`](normalize::simplify) folds constants and pushes
//!    negation down to the comparisons;
//! 3. [`evaluate_condition`](normalize::evaluate_condition) resolves
//!    chassis-local predicates through a caller-supplied callback;
//! 4. [`normalize`](normalize::normalize) produces a disjunction of
//!    conjunctive terms, keeping member sets of disjunctions intact so
//!    they can become OpenFlow conjunction clauses;
//! 5. [`to_matches`](to_matches::to_matches) renders the terms into
//!    `(match, conjunction)` tuples, resolving port names through a
//!    lookup callback.
//!
//! The crate owns no state beyond the symbol table; the driver decides
//! what to cache between the stages.

#![deny(clippy::all)]

pub mod ast;
pub mod lex;
pub mod normalize;
pub mod parse;
pub mod symtab;
pub mod to_matches;

pub use ast::{AddrSets, Cmp, CmpValue, Condition, Const, ConstFormat, ConstSet, Expr, FieldRef,
              PortGroups, Relop};
pub use normalize::{evaluate_condition, normalize, simplify, Normalized, Term};
pub use parse::{parse_match, ParseResult};
pub use symtab::Symtab;
pub use to_matches::{matches_prepare, to_matches, ExprMatch};

use thiserror::Error;

/// Errors from parsing or annotating a match expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown field or predicate '{0}'")]
    UnknownSymbol(String),
    #[error("unknown address set '{0}'")]
    UnknownAddrSet(String),
    #[error("unknown port group '{0}'")]
    UnknownPortGroup(String),
    #[error("constant {0:#x} does not fit field '{1}'")]
    ConstantTooWide(u128, String),
    #[error("operator {0} not applicable to field '{1}'")]
    BadRelop(&'static str, String),
    #[error("bad constant: {0}")]
    BadConstant(String),
}
