// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Encoding the typed action buffer into OpenFlow actions.

use crate::parse::LogAction;
use oflow::{Mff, OfAction, NatAction, Pipeline, TableMap};
use tracing::debug;

/// Callback resolving a logical port name to its port key.
pub type LookupPort<'a> = dyn FnMut(&str) -> Option<u64> + 'a;

/// The encoder environment: where this flow sits in the pipeline and
/// which tables and zones it should reference.
pub struct EncodeParams<'a> {
    pub tables: &'a TableMap,
    pub pipeline: Pipeline,
    /// The logical table the flow lives in; `next;` resolves relative to
    /// it.
    pub cur_ltable: u8,
    /// Meter for packets this flow punts to the controller.
    pub ctrl_meter_id: Option<u32>,
    /// Zone register for NAT commits: the SNAT zone when the datapath
    /// pins one explicitly, the DNAT zone otherwise.
    pub common_nat_ct_zone: Mff,
}

impl EncodeParams<'_> {
    fn ptable(&self, ltable: u8) -> u8 {
        self.pipeline.first_ptable(self.tables) + ltable
    }
}

/// Encode the buffer into OpenFlow actions.
pub fn encode(
    actions: &[LogAction],
    ep: &EncodeParams<'_>,
    lookup_port: &mut LookupPort<'_>,
) -> Vec<OfAction> {
    let mut out = Vec::with_capacity(actions.len());
    for action in actions {
        match action {
            LogAction::Next { ltable } => {
                out.push(OfAction::Resubmit {
                    table: ep.ptable(*ltable),
                });
            }
            LogAction::Output => {
                out.push(OfAction::Resubmit {
                    table: ep.pipeline.output_ptable(ep.tables),
                });
            }
            LogAction::SetField { field, value } => {
                out.push(OfAction::SetField {
                    field: field.mff,
                    ofs: field.ofs as u8,
                    n_bits: field.n_bits as u8,
                    value: *value,
                });
            }
            LogAction::SetPort { field, port } => {
                // An unknown port loads key 0, which never addresses a
                // real port; the lookup recorded the reference so the
                // flow is recompiled when the binding appears.
                let key = lookup_port(port).unwrap_or_else(|| {
                    debug!("output port {port} unknown, loading 0");
                    0
                });
                out.push(OfAction::load(*field, u128::from(key)));
            }
            LogAction::CtNext => {
                out.push(OfAction::Ct {
                    commit: false,
                    zone_src: Mff::LOG_CT_ZONE,
                    recirc_table: Some(ep.ptable(ep.cur_ltable + 1)),
                    nat: None,
                });
            }
            LogAction::CtCommit => {
                out.push(OfAction::Ct {
                    commit: true,
                    zone_src: Mff::LOG_CT_ZONE,
                    recirc_table: None,
                    nat: None,
                });
            }
            LogAction::CtDnat { addr } => {
                out.push(OfAction::Ct {
                    commit: addr.is_some(),
                    zone_src: ep.common_nat_ct_zone,
                    recirc_table: Some(ep.ptable(ep.cur_ltable + 1)),
                    nat: Some(NatAction {
                        src: false,
                        addr: *addr,
                    }),
                });
            }
            LogAction::CtSnat { addr } => {
                out.push(OfAction::Ct {
                    commit: addr.is_some(),
                    zone_src: ep.common_nat_ct_zone,
                    recirc_table: Some(ep.ptable(ep.cur_ltable + 1)),
                    nat: Some(NatAction {
                        src: true,
                        addr: *addr,
                    }),
                });
            }
            LogAction::PutDhcpOpts { v6, opts } => {
                out.push(OfAction::Controller {
                    meter_id: ep.ctrl_meter_id,
                    userdata: dhcp_userdata(*v6, opts),
                });
            }
        }
    }
    out
}

/// Serialize DHCP options as `(code, len, value)` records behind a
/// one-byte family tag.
fn dhcp_userdata(v6: bool, opts: &[(u8, u128)]) -> Vec<u8> {
    let mut out = vec![u8::from(v6)];
    for (code, value) in opts {
        let bytes = value.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(15);
        // At least one byte, dropping leading zeros.
        let payload = &bytes[first.min(15)..];
        out.push(*code);
        out.push(payload.len() as u8);
        out.extend_from_slice(payload);
    }
    out
}
