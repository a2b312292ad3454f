// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The southbound view: typed rows, tracked changes and secondary
//! indexes.
//!
//! The real database client lives outside this crate; what the engine
//! consumes is this in-memory mirror. Row maps are `BTreeMap`s keyed by
//! uuid so that full scans are deterministic. Mutations go through the
//! typed `insert_*`/`remove_*` methods, which keep the secondary indexes
//! current and append to the per-table tracked-change lists the
//! incremental handlers drain.

use ahash::RandomState;
use expr::{ConstSet, PortGroups};
use oflow::{Pipeline, TableMap};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// How a tracked row changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    New,
    Updated,
    Deleted,
}

/// A tracked change: the row snapshot at the time of the event (the old
/// row for deletions).
#[derive(Debug, Clone)]
pub struct Tracked<T> {
    pub row: T,
    pub change: Change,
}

impl<T> Tracked<T> {
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.change == Change::New
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.change == Change::Deleted
    }
}

/// A logical flow row.
#[derive(Debug, Clone)]
pub struct LogicalFlowRow {
    pub uuid: Uuid,
    pub pipeline: Pipeline,
    pub table_id: u8,
    pub priority: u16,
    pub match_expr: String,
    pub actions: String,
    /// Exactly one of these is set.
    pub logical_datapath: Option<Uuid>,
    pub logical_dp_group: Option<Uuid>,
    pub controller_meter: Option<String>,
    pub tags: HashMap<String, String, RandomState>,
}

impl LogicalFlowRow {
    /// The `in_out_port` tag, when present: the flow only applies where
    /// this port is the local inport/outport.
    #[must_use]
    pub fn in_out_port(&self) -> Option<&str> {
        self.tags.get("in_out_port").map(String::as_str)
    }
}

/// A logical datapath (switch or router) row.
#[derive(Debug, Clone)]
pub struct DatapathRow {
    pub uuid: Uuid,
    pub tunnel_key: u64,
    pub external_ids: HashMap<String, String, RandomState>,
}

/// A group of datapaths a logical flow can be scoped to.
#[derive(Debug, Clone)]
pub struct DpGroupRow {
    pub uuid: Uuid,
    pub datapaths: Vec<Uuid>,
}

/// One member of an HA chassis group.
#[derive(Debug, Clone)]
pub struct HaMember {
    pub chassis: String,
    pub priority: i32,
}

/// The HA group of a chassis-redirect port.
#[derive(Debug, Clone, Default)]
pub struct HaChassisGroup {
    pub members: Vec<HaMember>,
}

impl HaChassisGroup {
    #[must_use]
    pub fn contains(&self, chassis: &str) -> bool {
        self.members.iter().any(|m| m.chassis == chassis)
    }

    /// The member designated active given the set of chassis with live
    /// tunnels: the highest-priority member that is reachable (or is
    /// `this_chassis` itself).
    #[must_use]
    pub fn active_chassis<'a>(
        &'a self,
        active_tunnels: &HashSet<String, RandomState>,
        this_chassis: &str,
    ) -> Option<&'a str> {
        self.members
            .iter()
            .filter(|m| m.chassis == this_chassis || active_tunnels.contains(&m.chassis))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.chassis.cmp(&b.chassis))
            })
            .map(|m| m.chassis.as_str())
    }
}

/// A port binding row.
#[derive(Debug, Clone)]
pub struct PortBindingRow {
    pub uuid: Uuid,
    pub logical_port: String,
    pub ptype: String,
    pub datapath: Uuid,
    pub tunnel_key: u64,
    /// The chassis the port is bound on, if any.
    pub chassis: Option<String>,
    pub ha_chassis_group: Option<HaChassisGroup>,
    /// `port_security` entries: "<mac> [<ip>[/plen]]...".
    pub port_security: Vec<String>,
}

/// A multicast group row.
#[derive(Debug, Clone)]
pub struct McastGroupRow {
    pub uuid: Uuid,
    pub name: String,
    pub datapath: Uuid,
    pub tunnel_key: u64,
}

/// One load-balancer backend.
#[derive(Debug, Clone)]
pub struct LbBackend {
    pub ip: std::net::IpAddr,
    pub port: u16,
}

/// One load-balancer VIP with its backends.
#[derive(Debug, Clone)]
pub struct LbVip {
    pub vip: std::net::IpAddr,
    pub vip_port: u16,
    pub backends: Vec<LbBackend>,
}

/// A load balancer row.
#[derive(Debug, Clone)]
pub struct LoadBalancerRow {
    pub uuid: Uuid,
    pub name: String,
    /// "tcp" (default), "udp" or "sctp".
    pub protocol: String,
    pub vips: Vec<LbVip>,
    pub datapaths: Vec<Uuid>,
    pub hairpin_snat_ips: Vec<std::net::IpAddr>,
    /// Newer controllers preserve the original destination tuple in
    /// registers; older ones match conntrack directly.
    pub hairpin_orig_tuple: bool,
}

/// A learned MAC binding row.
#[derive(Debug, Clone)]
pub struct MacBindingRow {
    pub uuid: Uuid,
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: Uuid,
}

/// A statically configured MAC binding row.
#[derive(Debug, Clone)]
pub struct StaticMacBindingRow {
    pub uuid: Uuid,
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: Uuid,
    pub override_dynamic_mac: bool,
}

/// An FDB row.
#[derive(Debug, Clone)]
pub struct FdbRow {
    pub uuid: Uuid,
    pub mac: String,
    pub dp_key: u64,
    pub port_key: u64,
}

/// A DHCP(v6) option definition row.
#[derive(Debug, Clone)]
pub struct DhcpOptionsRow {
    pub uuid: Uuid,
    pub name: String,
    pub code: u8,
}

/// One table: rows by uuid plus the tracked-change list.
#[derive(Debug)]
pub struct SbTable<T> {
    rows: BTreeMap<Uuid, T>,
    tracked: Vec<Tracked<T>>,
}

impl<T> Default for SbTable<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            tracked: Vec::new(),
        }
    }
}

impl<T: Clone> SbTable<T> {
    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<&T> {
        self.rows.get(uuid)
    }

    /// Full scan in uuid order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Tracked changes since the last [`SbTable::clear_tracked`].
    #[must_use]
    pub fn tracked(&self) -> &[Tracked<T>] {
        &self.tracked
    }

    pub fn clear_tracked(&mut self) {
        self.tracked.clear();
    }

    fn put(&mut self, uuid: Uuid, row: T) {
        let change = if self.rows.contains_key(&uuid) {
            Change::Updated
        } else {
            Change::New
        };
        self.tracked.push(Tracked {
            row: row.clone(),
            change,
        });
        self.rows.insert(uuid, row);
    }

    fn take(&mut self, uuid: &Uuid) -> Option<T> {
        let row = self.rows.remove(uuid)?;
        self.tracked.push(Tracked {
            row: row.clone(),
            change: Change::Deleted,
        });
        Some(row)
    }
}

/// The southbound view the engine runs against.
#[derive(Debug, Default)]
pub struct SbView {
    pub logical_flows: SbTable<LogicalFlowRow>,
    pub datapaths: SbTable<DatapathRow>,
    pub dp_groups: SbTable<DpGroupRow>,
    pub port_bindings: SbTable<PortBindingRow>,
    pub multicast_groups: SbTable<McastGroupRow>,
    pub load_balancers: SbTable<LoadBalancerRow>,
    pub mac_bindings: SbTable<MacBindingRow>,
    pub static_mac_bindings: SbTable<StaticMacBindingRow>,
    pub fdbs: SbTable<FdbRow>,
    pub dhcp_options: SbTable<DhcpOptionsRow>,
    pub dhcpv6_options: SbTable<DhcpOptionsRow>,

    // Secondary indexes.
    pb_by_name: HashMap<String, Uuid, RandomState>,
    mg_by_name_dp: HashMap<(String, Uuid), Uuid, RandomState>,
    lflow_by_dp: HashMap<Uuid, HashSet<Uuid, RandomState>, RandomState>,
    lflow_by_group: HashMap<Uuid, HashSet<Uuid, RandomState>, RandomState>,
    mb_by_dp: HashMap<Uuid, HashSet<Uuid, RandomState>, RandomState>,
    smb_by_dp: HashMap<Uuid, HashSet<Uuid, RandomState>, RandomState>,
    fdb_by_dp_key: HashMap<u64, HashSet<Uuid, RandomState>, RandomState>,
}

impl SbView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every table's tracked-change list (end of tick).
    pub fn clear_tracked(&mut self) {
        self.logical_flows.clear_tracked();
        self.datapaths.clear_tracked();
        self.dp_groups.clear_tracked();
        self.port_bindings.clear_tracked();
        self.multicast_groups.clear_tracked();
        self.load_balancers.clear_tracked();
        self.mac_bindings.clear_tracked();
        self.static_mac_bindings.clear_tracked();
        self.fdbs.clear_tracked();
        self.dhcp_options.clear_tracked();
        self.dhcpv6_options.clear_tracked();
    }

    // Logical flows.

    pub fn insert_logical_flow(&mut self, row: LogicalFlowRow) {
        debug_assert!(
            row.logical_datapath.is_some() != row.logical_dp_group.is_some(),
            "a logical flow is scoped to a datapath or a group, never both or neither"
        );
        self.unindex_logical_flow(&row.uuid);
        if let Some(dp) = row.logical_datapath {
            self.lflow_by_dp.entry(dp).or_default().insert(row.uuid);
        }
        if let Some(group) = row.logical_dp_group {
            self.lflow_by_group
                .entry(group)
                .or_default()
                .insert(row.uuid);
        }
        self.logical_flows.put(row.uuid, row);
    }

    pub fn remove_logical_flow(&mut self, uuid: &Uuid) {
        self.unindex_logical_flow(uuid);
        self.logical_flows.take(uuid);
    }

    fn unindex_logical_flow(&mut self, uuid: &Uuid) {
        if let Some(old) = self.logical_flows.get(uuid) {
            if let Some(dp) = old.logical_datapath {
                if let Some(set) = self.lflow_by_dp.get_mut(&dp) {
                    set.remove(uuid);
                }
            }
            if let Some(group) = old.logical_dp_group {
                if let Some(set) = self.lflow_by_group.get_mut(&group) {
                    set.remove(uuid);
                }
            }
        }
    }

    /// Logical flows scoped directly to `dp`, in uuid order.
    #[must_use]
    pub fn lflows_by_datapath(&self, dp: &Uuid) -> Vec<&LogicalFlowRow> {
        self.sorted_rows(&self.lflow_by_dp, dp, &self.logical_flows)
    }

    /// Logical flows scoped to the group `group`, in uuid order.
    #[must_use]
    pub fn lflows_by_dp_group(&self, group: &Uuid) -> Vec<&LogicalFlowRow> {
        self.sorted_rows(&self.lflow_by_group, group, &self.logical_flows)
    }

    // Datapaths and groups.

    pub fn insert_datapath(&mut self, row: DatapathRow) {
        self.datapaths.put(row.uuid, row);
    }

    pub fn insert_dp_group(&mut self, row: DpGroupRow) {
        self.dp_groups.put(row.uuid, row);
    }

    // Port bindings.

    pub fn insert_port_binding(&mut self, row: PortBindingRow) {
        if let Some(old) = self.port_bindings.get(&row.uuid) {
            self.pb_by_name.remove(&old.logical_port);
        }
        self.pb_by_name.insert(row.logical_port.clone(), row.uuid);
        self.port_bindings.put(row.uuid, row);
    }

    pub fn remove_port_binding(&mut self, uuid: &Uuid) {
        if let Some(old) = self.port_bindings.take(uuid) {
            self.pb_by_name.remove(&old.logical_port);
        }
    }

    #[must_use]
    pub fn pb_by_name(&self, name: &str) -> Option<&PortBindingRow> {
        self.pb_by_name
            .get(name)
            .and_then(|uuid| self.port_bindings.get(uuid))
    }

    // Multicast groups.

    pub fn insert_multicast_group(&mut self, row: McastGroupRow) {
        if let Some(old) = self.multicast_groups.get(&row.uuid) {
            self.mg_by_name_dp.remove(&(old.name.clone(), old.datapath));
        }
        self.mg_by_name_dp
            .insert((row.name.clone(), row.datapath), row.uuid);
        self.multicast_groups.put(row.uuid, row);
    }

    pub fn remove_multicast_group(&mut self, uuid: &Uuid) {
        if let Some(old) = self.multicast_groups.take(uuid) {
            self.mg_by_name_dp.remove(&(old.name, old.datapath));
        }
    }

    #[must_use]
    pub fn mg_by_name_dp(&self, name: &str, dp: &Uuid) -> Option<&McastGroupRow> {
        self.mg_by_name_dp
            .get(&(name.to_string(), *dp))
            .and_then(|uuid| self.multicast_groups.get(uuid))
    }

    // Load balancers.

    pub fn insert_load_balancer(&mut self, row: LoadBalancerRow) {
        self.load_balancers.put(row.uuid, row);
    }

    pub fn remove_load_balancer(&mut self, uuid: &Uuid) {
        self.load_balancers.take(uuid);
    }

    // MAC bindings.

    pub fn insert_mac_binding(&mut self, row: MacBindingRow) {
        if let Some(old) = self.mac_bindings.get(&row.uuid) {
            let dp = old.datapath;
            if let Some(set) = self.mb_by_dp.get_mut(&dp) {
                set.remove(&row.uuid);
            }
        }
        self.mb_by_dp.entry(row.datapath).or_default().insert(row.uuid);
        self.mac_bindings.put(row.uuid, row);
    }

    pub fn remove_mac_binding(&mut self, uuid: &Uuid) {
        if let Some(old) = self.mac_bindings.take(uuid) {
            if let Some(set) = self.mb_by_dp.get_mut(&old.datapath) {
                set.remove(uuid);
            }
        }
    }

    #[must_use]
    pub fn mac_bindings_by_datapath(&self, dp: &Uuid) -> Vec<&MacBindingRow> {
        self.sorted_rows(&self.mb_by_dp, dp, &self.mac_bindings)
    }

    pub fn insert_static_mac_binding(&mut self, row: StaticMacBindingRow) {
        if let Some(old) = self.static_mac_bindings.get(&row.uuid) {
            let dp = old.datapath;
            if let Some(set) = self.smb_by_dp.get_mut(&dp) {
                set.remove(&row.uuid);
            }
        }
        self.smb_by_dp.entry(row.datapath).or_default().insert(row.uuid);
        self.static_mac_bindings.put(row.uuid, row);
    }

    pub fn remove_static_mac_binding(&mut self, uuid: &Uuid) {
        if let Some(old) = self.static_mac_bindings.take(uuid) {
            if let Some(set) = self.smb_by_dp.get_mut(&old.datapath) {
                set.remove(uuid);
            }
        }
    }

    #[must_use]
    pub fn static_mac_bindings_by_datapath(&self, dp: &Uuid) -> Vec<&StaticMacBindingRow> {
        self.sorted_rows(&self.smb_by_dp, dp, &self.static_mac_bindings)
    }

    // FDB.

    pub fn insert_fdb(&mut self, row: FdbRow) {
        if let Some(old) = self.fdbs.get(&row.uuid) {
            let key = old.dp_key;
            if let Some(set) = self.fdb_by_dp_key.get_mut(&key) {
                set.remove(&row.uuid);
            }
        }
        self.fdb_by_dp_key.entry(row.dp_key).or_default().insert(row.uuid);
        self.fdbs.put(row.uuid, row);
    }

    pub fn remove_fdb(&mut self, uuid: &Uuid) {
        if let Some(old) = self.fdbs.take(uuid) {
            if let Some(set) = self.fdb_by_dp_key.get_mut(&old.dp_key) {
                set.remove(uuid);
            }
        }
    }

    #[must_use]
    pub fn fdbs_by_dp_key(&self, dp_key: u64) -> Vec<&FdbRow> {
        let mut uuids: Vec<Uuid> = self
            .fdb_by_dp_key
            .get(&dp_key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        uuids.sort_unstable();
        uuids.iter().filter_map(|u| self.fdbs.get(u)).collect()
    }

    // DHCP options.

    pub fn insert_dhcp_options(&mut self, row: DhcpOptionsRow) {
        self.dhcp_options.put(row.uuid, row);
    }

    pub fn insert_dhcpv6_options(&mut self, row: DhcpOptionsRow) {
        self.dhcpv6_options.put(row.uuid, row);
    }

    fn sorted_rows<'a, T: Clone>(
        &'a self,
        index: &HashMap<Uuid, HashSet<Uuid, RandomState>, RandomState>,
        key: &Uuid,
        table: &'a SbTable<T>,
    ) -> Vec<&'a T> {
        let mut uuids: Vec<Uuid> = index
            .get(key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        uuids.sort_unstable();
        uuids.iter().filter_map(|u| table.get(u)).collect()
    }
}

/// A logical datapath with at least one local port binding.
#[derive(Debug, Clone)]
pub struct LocalDatapath {
    pub datapath: Uuid,
    pub tunnel_key: u64,
    pub is_switch: bool,
    pub external_ids: HashMap<String, String, RandomState>,
}

/// Per-run chassis context: everything the engine needs besides the
/// database view, passed as typed arguments.
#[derive(Debug)]
pub struct ChassisCtx {
    pub chassis: String,
    /// Chassis names with established tunnels.
    pub active_tunnels: HashSet<String, RandomState>,
    /// Local datapaths keyed by tunnel key.
    pub local_datapaths: HashMap<u64, LocalDatapath, RandomState>,
    /// `(datapath key, port key)` pairs of lports related to this
    /// chassis.
    pub related_lport_ids: HashSet<(u64, u64), RandomState>,
    pub addr_sets: HashMap<String, ConstSet, RandomState>,
    pub port_groups: PortGroups,
    /// Chassis name → tunnel ofport.
    pub chassis_tunnels: HashMap<String, u32, RandomState>,
    /// Emit the legacy ct_label-based hairpin detection flows too.
    pub check_ct_label_for_lb_hairpin: bool,
    pub tables: TableMap,
}

impl ChassisCtx {
    /// A context for `chassis` with empty maps and the default table
    /// layout.
    #[must_use]
    pub fn new(chassis: &str) -> Self {
        Self {
            chassis: chassis.to_string(),
            active_tunnels: HashSet::with_hasher(RandomState::with_seed(0)),
            local_datapaths: HashMap::with_hasher(RandomState::with_seed(0)),
            related_lport_ids: HashSet::with_hasher(RandomState::with_seed(0)),
            addr_sets: HashMap::with_hasher(RandomState::with_seed(0)),
            port_groups: PortGroups::with_hasher(RandomState::with_seed(0)),
            chassis_tunnels: HashMap::with_hasher(RandomState::with_seed(0)),
            check_ct_label_for_lb_hairpin: false,
            tables: TableMap::default(),
        }
    }

    #[must_use]
    pub fn local_datapath(&self, tunnel_key: u64) -> Option<&LocalDatapath> {
        self.local_datapaths.get(&tunnel_key)
    }

    /// Whether `(dp_key, port_key)` names an lport related to this
    /// chassis.
    #[must_use]
    pub fn lport_is_related(&self, dp_key: u64, port_key: u64) -> bool {
        self.related_lport_ids.contains(&(dp_key, port_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dp_row(key: u64) -> DatapathRow {
        DatapathRow {
            uuid: Uuid::new_v4(),
            tunnel_key: key,
            external_ids: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    #[test]
    fn tracked_changes_record_old_rows_on_delete() {
        let mut view = SbView::new();
        let dp = dp_row(3);
        let pb = PortBindingRow {
            uuid: Uuid::new_v4(),
            logical_port: "lp1".into(),
            ptype: String::new(),
            datapath: dp.uuid,
            tunnel_key: 4,
            chassis: None,
            ha_chassis_group: None,
            port_security: Vec::new(),
        };
        let pb_uuid = pb.uuid;
        view.insert_datapath(dp);
        view.insert_port_binding(pb);
        view.clear_tracked();

        view.remove_port_binding(&pb_uuid);
        let tracked = view.port_bindings.tracked();
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].is_deleted());
        assert_eq!(tracked[0].row.logical_port, "lp1");
        assert!(view.pb_by_name("lp1").is_none());
    }

    #[test]
    fn lflow_indexes_follow_scope() {
        let mut view = SbView::new();
        let dp = Uuid::new_v4();
        let group = Uuid::new_v4();
        let by_dp = LogicalFlowRow {
            uuid: Uuid::new_v4(),
            pipeline: Pipeline::Ingress,
            table_id: 0,
            priority: 10,
            match_expr: "1".into(),
            actions: "next;".into(),
            logical_datapath: Some(dp),
            logical_dp_group: None,
            controller_meter: None,
            tags: HashMap::with_hasher(RandomState::with_seed(0)),
        };
        let by_group = LogicalFlowRow {
            logical_datapath: None,
            logical_dp_group: Some(group),
            uuid: Uuid::new_v4(),
            ..by_dp.clone()
        };
        let dp_flow = by_dp.uuid;
        view.insert_logical_flow(by_dp);
        view.insert_logical_flow(by_group);
        assert_eq!(view.lflows_by_datapath(&dp).len(), 1);
        assert_eq!(view.lflows_by_dp_group(&group).len(), 1);
        view.remove_logical_flow(&dp_flow);
        assert!(view.lflows_by_datapath(&dp).is_empty());
    }

    #[test]
    fn ha_group_active_selection() {
        let mut tunnels = HashSet::with_hasher(RandomState::with_seed(0));
        tunnels.insert("hv2".to_string());
        let group = HaChassisGroup {
            members: vec![
                HaMember { chassis: "hv1".into(), priority: 10 },
                HaMember { chassis: "hv2".into(), priority: 20 },
                HaMember { chassis: "hv3".into(), priority: 30 },
            ],
        };
        // hv3 has no live tunnel and is not us: hv2 wins.
        assert_eq!(group.active_chassis(&tunnels, "hv1"), Some("hv2"));
        // From hv3's own point of view it is reachable.
        assert_eq!(group.active_chassis(&tunnels, "hv3"), Some("hv3"));
    }
}
