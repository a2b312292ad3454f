// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! OpenFlow-level data model shared by the logical flow compiler.
//!
//! This crate holds the vocabulary the rest of the workspace speaks:
//! match field ids ([`Mff`]), the canonical [`Match`] type, the encoded
//! action union ([`OfAction`]) and the content-addressed desired flow
//! table behind the [`FlowSink`] contract. Nothing in here talks
//! OpenFlow on the wire; an external writer diffs the desired table
//! against the switch and issues the actual messages.

#![deny(clippy::all)]

pub mod action;
pub mod desired;
pub mod field;
pub mod fmatch;
pub mod table;

pub use action::{LearnAction, LearnSpec, NatAction, OfAction};
pub use desired::{AsInfo, Conjunction, DesiredFlowTable, FlowSink};
pub use field::{Mff, Mlf};
pub use fmatch::{Match, MatchValue};
pub use table::{Pipeline, TableMap};
