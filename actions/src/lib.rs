// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The logical action language.
//!
//! Actions arrive as strings (`"next;"`, `"ct_commit; outport = \"p\";
//! output;"`). [`parse_actions`](parse::parse_actions) turns a string
//! into a typed action buffer plus a *prerequisite* expression: match
//! refinements the actions require (`ct_next` only makes sense for IP
//! traffic, so it contributes `ip`). The engine conjoins the
//! prerequisites into the flow's match before normalization.
//!
//! [`encode`](encode::encode) renders the buffer into [`oflow`] actions
//! against an environment: the physical table layout, the position in
//! the logical pipeline, port lookup callbacks and conntrack zone
//! assignments.

#![deny(clippy::all)]

pub mod encode;
pub mod parse;

pub use encode::{encode, EncodeParams};
pub use parse::{parse_actions, DhcpOptsMap, LogAction, ParseParams, ParsedActions};

use thiserror::Error;

/// Errors from parsing an action string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{0}' is not assignable")]
    NotAssignable(String),
    #[error("'drop;' must be the only action")]
    DropNotAlone,
    #[error("cannot advance beyond the last logical table")]
    NextPastEnd,
    #[error("unknown DHCP option '{0}'")]
    UnknownDhcpOption(String),
    #[error("bad action argument: {0}")]
    BadArgument(String),
    #[error(transparent)]
    Expr(#[from] expr::ExprError),
}
