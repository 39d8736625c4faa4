//! Host group computation for job inventories.
//!
//! Pure functions over a `Topology`; the planner reuses them to feed the
//! `groups` variable of template rendering.

use std::collections::{BTreeMap, BTreeSet};

use crate::database::{HcDelta, HcEntry, MaintenanceMode};
use crate::topology::Topology;

pub const CLUSTER_GROUP: &str = "CLUSTER";
pub const PROVIDER_GROUP: &str = "PROVIDER";
pub const HOST_GROUP: &str = "HOST";
pub const TARGET_GROUP: &str = "target";

const MM_SUFFIX: &str = "maintenance_mode";

/// Group name to member host ids
pub type HostGroups = BTreeMap<String, BTreeSet<i64>>;

/// Only ON moves a host into `.maintenance_mode`; CHANGING hosts stay in the
/// live groups while their maintenance action runs
fn in_maintenance(mode: MaintenanceMode) -> bool {
    mode == MaintenanceMode::On
}

fn push(groups: &mut HostGroups, name: &str, in_mm: bool, host_id: i64) {
    let name = if in_mm {
        format!("{}.{}", name, MM_SUFFIX)
    } else {
        name.to_string()
    };
    groups.entry(name).or_default().insert(host_id);
}

fn component_group(topology: &Topology, entry: &HcEntry) -> Option<String> {
    let (service, component) = topology.component(entry.component_id)?;
    Some(format!("{}.{}", service.prototype.name, component.prototype.name))
}

/// Groups of a cluster inventory.
///
/// The mapping is the persisted one with the task delta applied on top:
/// hosts being added already appear in `S` and `S.C`, hosts being removed
/// no longer do. `.add`/`.remove` groups exist only when a delta is given.
pub fn cluster_groups(topology: &Topology, delta: Option<&HcDelta>) -> HostGroups {
    let mut groups = HostGroups::new();

    for host in topology.hosts.values() {
        push(
            &mut groups,
            CLUSTER_GROUP,
            in_maintenance(host.host.maintenance_mode),
            host.host.id,
        );
    }

    let mut mapping = topology.hostcomponent.clone();
    if let Some(delta) = delta {
        for entry in &delta.remove {
            mapping.remove(entry);
        }
        mapping.extend(delta.add.iter().copied());
    }

    for entry in &mapping {
        let Some((service, component)) = topology.component(entry.component_id) else {
            continue;
        };
        let host_in_mm = in_maintenance(topology.host_mm(entry.host_id));

        let name = format!("{}.{}", service.prototype.name, component.prototype.name);
        let component_in_mm =
            host_in_mm || in_maintenance(topology.component_mm(component.component.id));
        push(&mut groups, &name, component_in_mm, entry.host_id);

        let service_in_mm =
            host_in_mm || in_maintenance(topology.service_mm(service.service.id));
        push(&mut groups, &service.prototype.name, service_in_mm, entry.host_id);
    }

    if let Some(delta) = delta {
        for (suffix, entries) in [("add", &delta.add), ("remove", &delta.remove)] {
            for entry in entries {
                let Some(name) = component_group(topology, entry) else {
                    continue;
                };
                let host_in_mm = in_maintenance(topology.host_mm(entry.host_id));
                push(
                    &mut groups,
                    &format!("{}.{}", name, suffix),
                    host_in_mm,
                    entry.host_id,
                );
            }
        }
    }

    groups
}

/// Same groups with host names instead of ids
pub fn fqdn_groups(groups: &HostGroups, topology: &Topology) -> BTreeMap<String, Vec<String>> {
    groups
        .iter()
        .map(|(name, hosts)| {
            let fqdns = hosts.iter().map(|id| topology.fqdn(*id)).collect();
            (name.clone(), fqdns)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::mapping::tests::sample_topology;

    fn entry(host_id: i64, service_id: i64, component_id: i64) -> HcEntry {
        HcEntry {
            host_id,
            service_id,
            component_id,
        }
    }

    fn ids(items: &[i64]) -> BTreeSet<i64> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_groups_from_mapping() {
        let mapping = [entry(101, 2, 21), entry(102, 2, 22)].into_iter().collect();
        let topology = sample_topology().with_mapping(&mapping);

        let groups = cluster_groups(&topology, None);
        assert_eq!(groups["CLUSTER"], ids(&[101, 102, 103]));
        assert_eq!(groups["db"], ids(&[101, 102]));
        assert_eq!(groups["db.master"], ids(&[101]));
        assert_eq!(groups["db.agent"], ids(&[102]));
        assert!(!groups.contains_key("web"));
        assert!(!groups.contains_key("db.master.add"));
    }

    #[test]
    fn test_delta_adds_and_removes() {
        let mapping = [entry(101, 2, 21), entry(102, 2, 21)].into_iter().collect();
        let topology = sample_topology().with_mapping(&mapping);
        let delta = HcDelta {
            current: mapping.iter().copied().collect(),
            add: vec![entry(103, 2, 21)],
            remove: vec![entry(102, 2, 21)],
        };

        let groups = cluster_groups(&topology, Some(&delta));
        assert_eq!(groups["db.master"], ids(&[101, 103]));
        assert_eq!(groups["db"], ids(&[101, 103]));
        assert_eq!(groups["db.master.add"], ids(&[103]));
        assert_eq!(groups["db.master.remove"], ids(&[102]));
    }

    #[test]
    fn test_changing_hosts_stay_live() {
        let mapping = [entry(101, 2, 21), entry(102, 2, 21)].into_iter().collect();
        let mut topology = sample_topology().with_mapping(&mapping);
        if let Some(host) = topology.hosts.get_mut(&102) {
            host.host.maintenance_mode = MaintenanceMode::Changing;
        }

        let groups = cluster_groups(&topology, None);
        assert_eq!(groups["CLUSTER"], ids(&[101, 102, 103]));
        assert_eq!(groups["db.master"], ids(&[101, 102]));
        assert!(!groups.contains_key("CLUSTER.maintenance_mode"));
        assert!(!groups.contains_key("db.master.maintenance_mode"));
    }

    #[test]
    fn test_maintenance_mode_hosts_are_split_out() {
        let mapping = [entry(101, 2, 21), entry(102, 2, 21)].into_iter().collect();
        let mut topology = sample_topology().with_mapping(&mapping);
        if let Some(host) = topology.hosts.get_mut(&102) {
            host.host.maintenance_mode = MaintenanceMode::On;
        }

        let groups = cluster_groups(&topology, None);
        assert_eq!(groups["CLUSTER"], ids(&[101, 103]));
        assert_eq!(groups["CLUSTER.maintenance_mode"], ids(&[102]));
        assert_eq!(groups["db.master"], ids(&[101]));
        assert_eq!(groups["db.master.maintenance_mode"], ids(&[102]));
        assert_eq!(groups["db.maintenance_mode"], ids(&[102]));
    }

    #[test]
    fn test_component_in_maintenance_mode() {
        let mapping = [entry(101, 2, 21), entry(101, 2, 22)].into_iter().collect();
        let mut topology = sample_topology().with_mapping(&mapping);
        if let Some(service) = topology.services.get_mut(&2) {
            if let Some(component) = service.components.get_mut(&22) {
                component.component.maintenance_mode = MaintenanceMode::On;
            }
        }

        let groups = cluster_groups(&topology, None);
        assert_eq!(groups["db.master"], ids(&[101]));
        assert_eq!(groups["db.agent.maintenance_mode"], ids(&[101]));
        assert!(!groups.contains_key("db.agent"));
        assert_eq!(groups["db"], ids(&[101]));
    }

    #[test]
    fn test_fqdn_groups() {
        let mapping = [entry(101, 2, 21)].into_iter().collect();
        let topology = sample_topology().with_mapping(&mapping);
        let groups = cluster_groups(&topology, None);
        let named = fqdn_groups(&groups, &topology);
        assert_eq!(named["db.master"], vec!["h1".to_string()]);
    }
}
