// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The logical-to-physical flow translator.
//!
//! One instance runs per chassis. It compiles the cluster-wide table of
//! logical flows, declarative `(match, actions)` rules scoped to
//! logical datapaths, into the desired OpenFlow rules of the local
//! switch, and keeps that translation up to date incrementally as the
//! southbound view changes.
//!
//! The interesting machinery:
//!
//! - [`RefTracker`]: which external symbols (address sets, port groups,
//!   port bindings, multicast groups) each logical flow depended on
//!   during compilation, so a symbol change recompiles exactly the
//!   affected flows.
//! - [`ConjIdAllocator`]: stable 32-bit conjunction id ranges per
//!   `(flow, datapath)`.
//! - [`LflowCache`]: three-state memoization of per-flow compilation
//!   artifacts under a byte budget.
//! - [`LflowEngine`]: the compilation pipeline and the full/incremental
//!   run protocols, plus the load-balancer hairpin and port-security
//!   rule generators.

#![deny(clippy::all)]

pub mod cache;
mod compile;
pub mod conj_ids;
pub mod engine;
pub mod extend_table;
mod hairpin;
pub mod idpool;
mod neighbors;
mod portsec;
pub mod refs;
pub mod view;

#[cfg(test)]
mod engine_test;

pub use cache::{CacheValue, LflowCache};
pub use conj_ids::ConjIdAllocator;
pub use engine::{AddrSetDiff, LflowEngine};
pub use extend_table::ExtendTable;
pub use idpool::IdPool;
pub use refs::{RefTracker, RefType};
pub use view::{ChassisCtx, LocalDatapath, SbView};
