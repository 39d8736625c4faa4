//! Host-component mapping checks.
//!
//! All checks are pure functions over a `Topology`. `check_mapping` runs them
//! in a fixed order and reports the first failure; the `*_violations`
//! helpers return every failure and feed issue detection.

use std::collections::BTreeSet;

use super::constraint::HostConstraint;
use super::Topology;
use crate::database::HcEntry;
use crate::errors::ConductorError;

/// Validate `desired` (host, component) pairs against `topology` and turn
/// them into full mapping entries.
pub fn check_mapping(
    topology: &Topology,
    desired: &BTreeSet<(i64, i64)>,
) -> Result<BTreeSet<HcEntry>, ConductorError> {
    let entries = resolve_entries(topology, desired)?;
    let next = topology.with_mapping(&entries);

    if let Some(err) = bind_violations(&next).into_iter().next() {
        return Err(err);
    }
    if let Some(err) = constraint_violations(&next).into_iter().next() {
        return Err(err);
    }
    if let Some(err) = requires_violations(&next, false).into_iter().next() {
        return Err(err);
    }
    Ok(entries)
}

/// Host membership: every host must be attached to the cluster and every
/// component must belong to one of its services.
fn resolve_entries(
    topology: &Topology,
    desired: &BTreeSet<(i64, i64)>,
) -> Result<BTreeSet<HcEntry>, ConductorError> {
    let mut entries = BTreeSet::new();
    for &(host_id, component_id) in desired {
        let Some((service, _)) = topology.component(component_id) else {
            return Err(ConductorError::ObjectNotFound {
                object: format!("component #{} in cluster {}", component_id, topology.cluster.name),
            });
        };
        if !topology.hosts.contains_key(&host_id) {
            return Err(ConductorError::ForeignHost {
                host: format!("#{}", host_id),
                cluster: topology.cluster.name.clone(),
            });
        }
        entries.insert(HcEntry {
            host_id,
            service_id: service.service.id,
            component_id,
        });
    }
    Ok(entries)
}

/// Hosts of a `bound_to` component must also carry the component it is bound to
pub fn bind_violations(topology: &Topology) -> Vec<ConductorError> {
    let mut violations = Vec::new();
    for service in topology.services.values() {
        for component in service.components.values() {
            let Some(bound) = &component.prototype.spec.bound_to else {
                continue;
            };
            let target_hosts = topology
                .component_by_name(&bound.service, &bound.component)
                .map(|(_, target)| target.hosts.clone())
                .unwrap_or_default();

            for host_id in &component.hosts {
                if !target_hosts.contains(host_id) {
                    violations.push(ConductorError::Bind {
                        host: topology.fqdn(*host_id),
                        service: bound.service.clone(),
                        component: bound.component.clone(),
                        bound_from: format!("{}.{}", service.prototype.name, component.prototype.name),
                    });
                }
            }
        }
    }
    violations
}

/// Host-count constraints of every component of every added service
pub fn constraint_violations(topology: &Topology) -> Vec<ConductorError> {
    let total = topology.hosts.len() as u64;
    let mut violations = Vec::new();
    for service in topology.services.values() {
        for component in service.components.values() {
            let Some(items) = &component.prototype.spec.constraint else {
                continue;
            };
            let name = format!("{}.{}", service.prototype.name, component.prototype.name);
            let constraint = match HostConstraint::parse(items) {
                Ok(constraint) => constraint,
                Err(e) => {
                    violations.push(ConductorError::ComponentConstraint {
                        component: name,
                        constraint: format!("{:?}", items),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if let Err(reason) = constraint.check(component.hosts.len() as u64, total) {
                violations.push(ConductorError::ComponentConstraint {
                    component: name,
                    constraint: constraint.to_string(),
                    reason,
                });
            }
        }
    }
    violations
}

/// Unsatisfied `requires` declarations.
///
/// Mapped components and the services owning them are always checked; with
/// `all_services` every added service is checked as well.
pub fn requires_violations(topology: &Topology, all_services: bool) -> Vec<ConductorError> {
    let mut violations = Vec::new();
    for service in topology.services.values() {
        let mapped = service.components.values().any(|c| !c.hosts.is_empty());
        if mapped || all_services {
            for requirement in &service.prototype.spec.requires {
                if !requirement_met(topology, &requirement.service, requirement.component.as_deref()) {
                    violations.push(ConductorError::Requires {
                        source: service.prototype.name.clone(),
                        requirement: requirement.to_string(),
                    });
                }
            }
        }

        for component in service.components.values() {
            if component.hosts.is_empty() {
                continue;
            }
            for requirement in &component.prototype.spec.requires {
                if !requirement_met(topology, &requirement.service, requirement.component.as_deref()) {
                    violations.push(ConductorError::Requires {
                        source: format!("{}.{}", service.prototype.name, component.prototype.name),
                        requirement: requirement.to_string(),
                    });
                }
            }
        }
    }
    violations
}

pub fn requirement_met(topology: &Topology, service: &str, component: Option<&str>) -> bool {
    match component {
        Some(component) => topology
            .component_by_name(service, component)
            .is_some_and(|(_, c)| !c.hosts.is_empty()),
        None => topology.service_by_name(service).is_some(),
    }
}
