//! Issue detection.
//!
//! Each cause is a predicate over the current store state. Detection only
//! reads; `ConcernService::refresh_*` turns the results into rows.

use anyhow::Result;
use std::collections::BTreeSet;

use super::ConcernService;
use crate::catalog::definition::PrototypeType;
use crate::database::{ConcernCause, ObjectRecord, ObjectRef, ObjectType};
use crate::topology::mapping::{bind_violations, constraint_violations, requirement_met};
use crate::topology::Topology;

/// Causes that can ever apply to an object of this type
pub fn causes_for(object_type: ObjectType) -> &'static [ConcernCause] {
    match object_type {
        ObjectType::Cluster => &[
            ConcernCause::Config,
            ConcernCause::Import,
            ConcernCause::Service,
            ConcernCause::HostComponent,
        ],
        ObjectType::Service => &[
            ConcernCause::Config,
            ConcernCause::Import,
            ConcernCause::Requirement,
        ],
        ObjectType::Component => &[ConcernCause::Config, ConcernCause::Requirement],
        ObjectType::Provider | ObjectType::Host | ObjectType::Adcm => &[ConcernCause::Config],
    }
}

/// Mapping breaks a bind or host-count constraint
pub fn has_mapping_issue(topology: &Topology) -> bool {
    !bind_violations(topology).is_empty() || !constraint_violations(topology).is_empty()
}

/// Own `requires` of a service, or of a mapped component, are not met
pub fn has_requirement_issue(topology: &Topology, object: ObjectRef) -> bool {
    let requires = match object.object_type {
        ObjectType::Service => match topology.services.get(&object.id) {
            Some(service) => &service.prototype.spec.requires,
            None => return false,
        },
        ObjectType::Component => match topology.component(object.id) {
            Some((_, component)) if !component.hosts.is_empty() => &component.prototype.spec.requires,
            _ => return false,
        },
        _ => return false,
    };
    requires
        .iter()
        .any(|r| !requirement_met(topology, &r.service, r.component.as_deref()))
}

impl ConcernService {
    /// Causes currently present on `object`.
    ///
    /// Cluster-scoped causes need `topology`; without one only CONFIG is
    /// evaluated.
    pub async fn detect_issues(
        &self,
        object: &ObjectRecord,
        topology: Option<&Topology>,
    ) -> Result<BTreeSet<ConcernCause>> {
        let owner = object.object_ref();
        let mut present = BTreeSet::new();

        for cause in causes_for(object.object_type) {
            let detected = match cause {
                ConcernCause::Config => !self.config.validate_completeness(owner).await?.is_empty(),
                ConcernCause::Import => self.missing_required_import(object).await?,
                ConcernCause::Service => match topology {
                    Some(topology) => self.missing_required_service(topology).await?,
                    None => false,
                },
                ConcernCause::HostComponent => topology.is_some_and(has_mapping_issue),
                ConcernCause::Requirement => {
                    topology.is_some_and(|t| has_requirement_issue(t, owner))
                }
            };
            if detected {
                present.insert(*cause);
            }
        }
        Ok(present)
    }

    /// A required import has no bind whose source prototype carries its name
    async fn missing_required_import(&self, object: &ObjectRecord) -> Result<bool> {
        let prototype = self.catalog.prototype(object.prototype_id).await?;
        let required: Vec<&String> = prototype
            .spec
            .import
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name)
            .collect();
        if required.is_empty() {
            return Ok(false);
        }

        let (cluster_id, service_id) = match object.object_type {
            ObjectType::Cluster => (object.id, None),
            ObjectType::Service => match object.cluster_id {
                Some(cluster_id) => (cluster_id, Some(object.id)),
                None => return Ok(false),
            },
            _ => return Ok(false),
        };

        let mut bound = BTreeSet::new();
        for bind in self.db.list_binds(cluster_id).await? {
            if bind.service_id != service_id {
                continue;
            }
            if let Some(source) = self.db.get_object(bind.source).await? {
                bound.insert(self.catalog.prototype(source.prototype_id).await?.name.clone());
            }
        }
        Ok(required.into_iter().any(|name| !bound.contains(name)))
    }

    /// A service prototype marked `required` in the cluster bundle is not added
    async fn missing_required_service(&self, topology: &Topology) -> Result<bool> {
        let bundle_id = topology.cluster_prototype.bundle_id;
        Ok(self
            .catalog
            .list_prototypes(bundle_id)
            .await?
            .iter()
            .filter(|p| p.prototype_type == PrototypeType::Service && p.spec.required)
            .any(|p| topology.service_by_name(&p.name).is_none()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::HcEntry;
    use crate::topology::mapping::tests::sample_topology;

    fn entry(host_id: i64, service_id: i64, component_id: i64) -> HcEntry {
        HcEntry {
            host_id,
            service_id,
            component_id,
        }
    }

    #[test]
    fn test_empty_mapping_violates_constraint() {
        assert!(has_mapping_issue(&sample_topology()));
    }

    #[test]
    fn test_valid_mapping_has_no_issue() {
        let entries = [entry(101, 2, 21), entry(101, 2, 22), entry(102, 3, 31)]
            .into_iter()
            .collect();
        let topology = sample_topology().with_mapping(&entries);
        assert!(!has_mapping_issue(&topology));
        assert!(!has_requirement_issue(&topology, ObjectRef::component(31)));
    }

    #[test]
    fn test_requirement_issue_only_on_mapped_component() {
        let topology = sample_topology();
        assert!(!has_requirement_issue(&topology, ObjectRef::component(31)));

        let entries = [entry(102, 3, 31)].into_iter().collect();
        let mapped = topology.with_mapping(&entries);
        assert!(has_requirement_issue(&mapped, ObjectRef::component(31)));
    }

    #[test]
    fn test_causes_by_type() {
        assert!(causes_for(ObjectType::Cluster).contains(&ConcernCause::HostComponent));
        assert_eq!(causes_for(ObjectType::Host), &[ConcernCause::Config]);
    }
}
