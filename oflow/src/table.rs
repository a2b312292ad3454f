// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The physical table layout of the local switch.
//!
//! Table numbers are not ambient constants: the encoder and the flow
//! generators receive a [`TableMap`] so that the pipeline layout is fixed
//! in exactly one place per deployment.

/// Numeric ids of the physical OpenFlow tables the compiler emits into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMap {
    pub log_ingress_pipeline: u8,
    pub remote_output: u8,
    pub log_egress_pipeline: u8,
    pub save_inport: u8,
    pub mac_binding: u8,
    pub mac_lookup: u8,
    pub chk_lb_hairpin: u8,
    pub chk_lb_hairpin_reply: u8,
    pub ct_snat_hairpin: u8,
    pub get_fdb: u8,
    pub lookup_fdb: u8,
    pub chk_in_port_sec: u8,
    pub chk_in_port_sec_nd: u8,
    pub chk_out_port_sec: u8,
}

impl Default for TableMap {
    fn default() -> Self {
        Self {
            log_ingress_pipeline: 8,
            remote_output: 37,
            log_egress_pipeline: 40,
            save_inport: 64,
            mac_binding: 66,
            mac_lookup: 67,
            chk_lb_hairpin: 68,
            chk_lb_hairpin_reply: 69,
            ct_snat_hairpin: 70,
            get_fdb: 71,
            lookup_fdb: 72,
            chk_in_port_sec: 73,
            chk_in_port_sec_nd: 74,
            chk_out_port_sec: 75,
        }
    }
}

/// Number of tables in one logical pipeline (ingress or egress).
pub const LOG_PIPELINE_LEN: u8 = 32;

/// Which logical pipeline a flow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipeline {
    Ingress,
    Egress,
}

impl Pipeline {
    /// First physical table of this pipeline.
    #[must_use]
    pub fn first_ptable(self, tables: &TableMap) -> u8 {
        match self {
            Pipeline::Ingress => tables.log_ingress_pipeline,
            Pipeline::Egress => tables.log_egress_pipeline,
        }
    }

    /// The table `output;` resubmits to.
    #[must_use]
    pub fn output_ptable(self, tables: &TableMap) -> u8 {
        match self {
            Pipeline::Ingress => tables.remote_output,
            Pipeline::Egress => tables.save_inport,
        }
    }
}
