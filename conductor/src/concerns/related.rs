//! Related-set computation over a cluster topology.
//!
//! The relation is symmetric inside a cluster: `b ∈ related(a)` iff
//! `a ∈ related(b)`. Provider concerns reach their hosts one way only and
//! are resolved by the service layer.

use std::collections::BTreeSet;

use crate::database::{ObjectRef, ObjectType};
use crate::topology::Topology;

pub fn related_in_topology(owner: ObjectRef, topology: &Topology) -> BTreeSet<ObjectRef> {
    let mut related = BTreeSet::new();
    let cluster = topology.cluster.object_ref();

    match owner.object_type {
        ObjectType::Cluster if owner == cluster => {
            for service in topology.services.values() {
                related.insert(service.service.object_ref());
                for component in service.components.values() {
                    related.insert(component.component.object_ref());
                }
            }
            related.extend(
                topology
                    .hosts
                    .values()
                    .filter(|h| !h.components.is_empty())
                    .map(|h| h.host.object_ref()),
            );
        }
        ObjectType::Service => {
            if let Some(service) = topology.services.get(&owner.id) {
                related.insert(cluster);
                for component in service.components.values() {
                    related.insert(component.component.object_ref());
                }
                related.extend(service.hosts().into_iter().map(ObjectRef::host));
            }
        }
        ObjectType::Component => {
            if let Some((service, component)) = topology.component(owner.id) {
                related.insert(cluster);
                related.insert(service.service.object_ref());
                related.extend(component.hosts.iter().copied().map(ObjectRef::host));
            }
        }
        ObjectType::Host => {
            if let Some(host) = topology.hosts.get(&owner.id) {
                if !host.components.is_empty() {
                    related.insert(cluster);
                }
                for component_id in &host.components {
                    if let Some((service, component)) = topology.component(*component_id) {
                        related.insert(service.service.object_ref());
                        related.insert(component.component.object_ref());
                    }
                }
            }
        }
        _ => {}
    }

    related
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::HcEntry;
    use crate::topology::mapping::tests::sample_topology;

    fn mapped() -> Topology {
        let topology = sample_topology();
        let entries = [
            HcEntry { host_id: 101, service_id: 2, component_id: 21 },
            HcEntry { host_id: 101, service_id: 2, component_id: 22 },
            HcEntry { host_id: 102, service_id: 3, component_id: 31 },
        ]
        .into_iter()
        .collect();
        topology.with_mapping(&entries)
    }

    #[test]
    fn test_component_reaches_service_cluster_and_its_hosts() {
        let related = related_in_topology(ObjectRef::component(21), &mapped());
        assert_eq!(
            related,
            [ObjectRef::cluster(1), ObjectRef::service(2), ObjectRef::host(101)]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn test_cluster_skips_unmapped_hosts() {
        let related = related_in_topology(ObjectRef::cluster(1), &mapped());
        assert!(related.contains(&ObjectRef::host(101)));
        assert!(related.contains(&ObjectRef::host(102)));
        assert!(!related.contains(&ObjectRef::host(103)));
        assert!(related.contains(&ObjectRef::component(31)));
    }

    #[test]
    fn test_relation_is_symmetric() {
        let topology = mapped();
        let objects = topology.objects();
        for a in &objects {
            for b in related_in_topology(*a, &topology) {
                assert!(
                    related_in_topology(b, &topology).contains(a),
                    "{} -> {} is not symmetric",
                    a,
                    b
                );
            }
        }
    }
}
