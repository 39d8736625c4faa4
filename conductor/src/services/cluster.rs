// File: conductor/src/services/cluster.rs
//! Object lifecycle: clusters, services, providers, hosts, binds, host
//! groups and the host-component mapping.
//!
//! Every mutation that can change issue state ends with a concern refresh of
//! the affected cluster (or of the standalone object).

use anyhow::Result;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::catalog::definition::PrototypeType;
use crate::catalog::{version, Catalog, SchemaSource};
use crate::concerns::ConcernService;
use crate::database::{
    BindRecord, ConcernType, Database, HcDelta, HostGroupKind, HostGroupRecord, MaintenanceMode,
    NewObject, ObjectRecord, ObjectRef, ObjectType, PrototypeRecord,
};
use crate::errors::ConductorError;
use crate::events::{DomainEvent, EventBus};
use crate::params::ConfigService;
use crate::topology::TopologyService;

pub struct ClusterService {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    config: Arc<ConfigService>,
    topology: Arc<TopologyService>,
    concerns: Arc<ConcernService>,
    events: EventBus,
}

impl ClusterService {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        config: Arc<ConfigService>,
        topology: Arc<TopologyService>,
        concerns: Arc<ConcernService>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            catalog,
            config,
            topology,
            concerns,
            events,
        }
    }

    async fn prototype_of_type(
        &self,
        prototype_id: i64,
        expected: PrototypeType,
    ) -> Result<Arc<PrototypeRecord>> {
        let prototype = self.catalog.prototype(prototype_id).await?;
        if prototype.prototype_type != expected {
            return Err(ConductorError::PrototypeNotFound {
                name: format!("{} prototype #{}", expected.as_str(), prototype_id),
            }
            .into());
        }
        Ok(prototype)
    }

    /// Insert an object and give it its initial ConfigLog
    async fn create_object(&self, object: NewObject) -> Result<ObjectRecord> {
        let id = self.db.insert_object(&object).await?;
        let owner = ObjectRef::new(object.object_type, id);
        let schema = self
            .catalog
            .get_config_schema(SchemaSource::Prototype(object.prototype_id))
            .await?;
        if let Some(root_id) = self.config.init_config(owner, &schema).await? {
            self.db.set_config_root(owner, root_id).await?;
        }
        self.db.require_object(owner).await
    }

    /// No task other than `within_task` may hold a lock visible on the object
    async fn ensure_unlocked(&self, object: ObjectRef, within_task: Option<i64>) -> Result<()> {
        let lock = self
            .concerns
            .concerns_on(object)
            .await?
            .into_iter()
            .find(|c| c.concern_type == ConcernType::Lock && (within_task.is_none() || c.task_id != within_task));
        if let Some(lock) = lock {
            let record = self.db.require_object(object).await?;
            return Err(ConductorError::TaskBlocked {
                object: record.name,
                reason: lock.reason.render(),
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // Clusters and services
    // ========================================================================

    #[instrument(skip(self, description))]
    pub async fn create_cluster(&self, prototype_id: i64, name: &str, description: &str) -> Result<ObjectRecord> {
        self.prototype_of_type(prototype_id, PrototypeType::Cluster).await?;
        let cluster = self
            .create_object(NewObject {
                object_type: ObjectType::Cluster,
                prototype_id,
                name: name.to_string(),
                description: description.to_string(),
                parent_id: None,
                cluster_id: None,
                config_root_id: None,
            })
            .await?;
        self.concerns.refresh_cluster(cluster.id).await?;
        info!("Cluster {} created (#{})", cluster.name, cluster.id);
        Ok(cluster)
    }

    /// Add a service of the cluster's bundle along with all its components
    #[instrument(skip(self))]
    pub async fn add_service(&self, cluster_id: i64, prototype_id: i64) -> Result<ObjectRecord> {
        let cluster = self.db.require_object(ObjectRef::cluster(cluster_id)).await?;
        let cluster_prototype = self.catalog.prototype(cluster.prototype_id).await?;
        let prototype = self.prototype_of_type(prototype_id, PrototypeType::Service).await?;
        if prototype.bundle_id != cluster_prototype.bundle_id {
            return Err(ConductorError::PrototypeNotFound {
                name: format!("service {} in bundle of cluster {}", prototype.name, cluster.name),
            }
            .into());
        }
        let existing = self.db.list_children(ObjectType::Service, cluster_id).await?;
        if existing.iter().any(|s| s.prototype_id == prototype_id) {
            return Err(ConductorError::NameConflict {
                kind: "service".to_string(),
                name: prototype.name.clone(),
            }
            .into());
        }

        let service = self
            .create_object(NewObject {
                object_type: ObjectType::Service,
                prototype_id,
                name: prototype.name.clone(),
                description: String::new(),
                parent_id: Some(cluster_id),
                cluster_id: Some(cluster_id),
                config_root_id: None,
            })
            .await?;
        for component in self.catalog.list_components(prototype_id).await? {
            self.create_object(NewObject {
                object_type: ObjectType::Component,
                prototype_id: component.id,
                name: component.name.clone(),
                description: String::new(),
                parent_id: Some(service.id),
                cluster_id: Some(cluster_id),
                config_root_id: None,
            })
            .await?;
        }

        self.concerns.refresh_cluster(cluster_id).await?;
        info!("Service {} added to cluster {}", service.name, cluster.name);
        Ok(service)
    }

    /// Remove a service with its components. Refused while another service
    /// requires it. Outside a task a mapped service is refused; from inside a
    /// task its mapping entries are dropped first.
    #[instrument(skip(self))]
    pub async fn delete_service(&self, service_id: i64, within_task: Option<i64>) -> Result<()> {
        let service_ref = ObjectRef::service(service_id);
        let service = self.db.require_object(service_ref).await?;
        let cluster_id = service.cluster_id.ok_or_else(|| ConductorError::ObjectNotFound {
            object: format!("cluster of service {}", service.name),
        })?;
        self.concerns.ensure_deletable(service_ref, within_task).await?;

        let topology = self.topology.retrieve_topology(cluster_id).await?;
        let Some(view) = topology.services.get(&service_id) else {
            return Err(ConductorError::ObjectNotFound {
                object: service_ref.to_string(),
            }
            .into());
        };
        if !view.hosts().is_empty() && within_task.is_none() {
            return Err(ConductorError::IssueIntegrity {
                object: service.name,
                reason: "service has mapped components".to_string(),
            }
            .into());
        }
        for other in topology.services.values().filter(|s| s.service.id != service_id) {
            if other.prototype.spec.requires.iter().any(|r| r.service == view.prototype.name) {
                return Err(ConductorError::Requires {
                    source: other.prototype.name.clone(),
                    requirement: view.prototype.name.clone(),
                }
                .into());
            }
        }

        if !view.hosts().is_empty() {
            let remaining: BTreeSet<_> = topology
                .hostcomponent
                .iter()
                .filter(|e| e.service_id != service_id)
                .copied()
                .collect();
            self.topology.commit_mapping(cluster_id, &remaining).await?;
            self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        }

        for component in view.components.values() {
            self.delete_groups_of(component.component.object_ref()).await?;
            self.db.delete_object(component.component.object_ref()).await?;
        }
        self.delete_groups_of(service_ref).await?;
        self.db.delete_object(service_ref).await?;

        self.concerns.refresh_cluster(cluster_id).await?;
        info!("Service {} deleted", service.name);
        Ok(())
    }

    /// Remove a cluster, its services and the mapping; hosts are detached
    #[instrument(skip(self))]
    pub async fn delete_cluster(&self, cluster_id: i64) -> Result<()> {
        let cluster_ref = ObjectRef::cluster(cluster_id);
        let cluster = self.db.require_object(cluster_ref).await?;
        self.concerns.ensure_deletable(cluster_ref, None).await?;

        let topology = self.topology.retrieve_topology(cluster_id).await?;
        self.topology
            .commit_mapping(cluster_id, &BTreeSet::new())
            .await?;
        for host_id in topology.hosts.keys() {
            self.topology.detach_host(*host_id).await?;
        }
        for service in topology.services.values() {
            for component in service.components.values() {
                self.delete_groups_of(component.component.object_ref()).await?;
                self.db.delete_object(component.component.object_ref()).await?;
            }
            self.delete_groups_of(service.service.object_ref()).await?;
            self.db.delete_object(service.service.object_ref()).await?;
        }
        self.delete_groups_of(cluster_ref).await?;
        self.db.delete_object(cluster_ref).await?;

        for host_id in topology.hosts.keys() {
            self.concerns.refresh_object(ObjectRef::host(*host_id)).await?;
        }
        self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        info!("Cluster {} deleted", cluster.name);
        Ok(())
    }

    async fn delete_groups_of(&self, owner: ObjectRef) -> Result<()> {
        for kind in [HostGroupKind::Config, HostGroupKind::Action] {
            for group in self.db.list_host_groups(kind, owner).await? {
                self.db.delete_host_group(group.id).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Providers and hosts
    // ========================================================================

    #[instrument(skip(self, description))]
    pub async fn create_provider(&self, prototype_id: i64, name: &str, description: &str) -> Result<ObjectRecord> {
        self.prototype_of_type(prototype_id, PrototypeType::Provider).await?;
        let provider = self
            .create_object(NewObject {
                object_type: ObjectType::Provider,
                prototype_id,
                name: name.to_string(),
                description: description.to_string(),
                parent_id: None,
                cluster_id: None,
                config_root_id: None,
            })
            .await?;
        self.concerns.refresh_object(provider.object_ref()).await?;
        Ok(provider)
    }

    #[instrument(skip(self))]
    pub async fn delete_provider(&self, provider_id: i64) -> Result<()> {
        let provider_ref = ObjectRef::provider(provider_id);
        let provider = self.db.require_object(provider_ref).await?;
        self.concerns.ensure_deletable(provider_ref, None).await?;
        if !self.db.list_children(ObjectType::Host, provider_id).await?.is_empty() {
            return Err(ConductorError::IssueIntegrity {
                object: provider.name,
                reason: "provider still has hosts".to_string(),
            }
            .into());
        }
        self.db.delete_object(provider_ref).await
    }

    /// Create a host from the host prototype of the provider's bundle
    #[instrument(skip(self, description))]
    pub async fn create_host(&self, provider_id: i64, fqdn: &str, description: &str) -> Result<ObjectRecord> {
        validate_fqdn(fqdn)?;
        let provider = self.db.require_object(ObjectRef::provider(provider_id)).await?;
        let provider_prototype = self.catalog.prototype(provider.prototype_id).await?;
        let host_prototype = self
            .catalog
            .list_prototypes(provider_prototype.bundle_id)
            .await?
            .into_iter()
            .find(|p| p.prototype_type == PrototypeType::Host)
            .ok_or_else(|| ConductorError::PrototypeNotFound {
                name: format!("host prototype in bundle of provider {}", provider.name),
            })?;

        let host = self
            .create_object(NewObject {
                object_type: ObjectType::Host,
                prototype_id: host_prototype.id,
                name: fqdn.to_string(),
                description: description.to_string(),
                parent_id: Some(provider_id),
                cluster_id: None,
                config_root_id: None,
            })
            .await?;
        self.concerns.refresh_object(host.object_ref()).await?;
        Ok(host)
    }

    /// Delete a host; refused while attached to a cluster
    #[instrument(skip(self))]
    pub async fn delete_host(&self, host_id: i64, within_task: Option<i64>) -> Result<()> {
        let host_ref = ObjectRef::host(host_id);
        let host = self.db.require_object(host_ref).await?;
        self.concerns.ensure_deletable(host_ref, within_task).await?;
        if let Some(cluster_id) = host.cluster_id {
            return Err(ConductorError::HostConflict {
                host: host.name,
                reason: format!("is attached to cluster #{}", cluster_id),
            }
            .into());
        }
        self.db.delete_object(host_ref).await
    }

    #[instrument(skip(self))]
    pub async fn add_host_to_cluster(&self, cluster_id: i64, host_id: i64, within_task: Option<i64>) -> Result<()> {
        self.ensure_unlocked(ObjectRef::cluster(cluster_id), within_task).await?;
        self.topology.attach_host(host_id, cluster_id).await?;
        self.concerns.refresh_cluster(cluster_id).await?;
        self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_host_from_cluster(&self, host_id: i64, within_task: Option<i64>) -> Result<()> {
        self.ensure_unlocked(ObjectRef::host(host_id), within_task).await?;
        if let Some(cluster_id) = self.topology.detach_host(host_id).await? {
            self.concerns.refresh_cluster(cluster_id).await?;
            self.concerns.refresh_object(ObjectRef::host(host_id)).await?;
            self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        }
        Ok(())
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Replace the cluster mapping with `desired` (host, component) pairs
    #[instrument(skip(self, desired))]
    pub async fn set_mapping(
        &self,
        cluster_id: i64,
        desired: &BTreeSet<(i64, i64)>,
        within_task: Option<i64>,
    ) -> Result<HcDelta> {
        self.ensure_unlocked(ObjectRef::cluster(cluster_id), within_task).await?;
        let delta = self.topology.set_mapping(cluster_id, desired).await?;
        self.concerns.refresh_cluster(cluster_id).await?;
        self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        info!(
            "Cluster #{} mapping set: +{} -{}",
            cluster_id,
            delta.add.len(),
            delta.remove.len()
        );
        Ok(delta)
    }

    // ========================================================================
    // Binds (imports/exports)
    // ========================================================================

    /// Bind a cluster (or one of its services) to an exporting cluster or
    /// service of another cluster
    #[instrument(skip(self))]
    pub async fn bind(&self, cluster_id: i64, service_id: Option<i64>, source: ObjectRef) -> Result<i64> {
        let importer = match service_id {
            Some(id) => self.db.require_object(ObjectRef::service(id)).await?,
            None => self.db.require_object(ObjectRef::cluster(cluster_id)).await?,
        };
        if importer.object_type == ObjectType::Service && importer.cluster_id != Some(cluster_id) {
            return Err(ConductorError::ObjectNotFound {
                object: format!("service {} in cluster #{}", importer.name, cluster_id),
            }
            .into());
        }

        let exporter = self.db.require_object(source).await?;
        let exporter_cluster = match exporter.object_type {
            ObjectType::Cluster => exporter.id,
            ObjectType::Service => exporter.cluster_id.unwrap_or_default(),
            _ => {
                return Err(ConductorError::ObjectNotFound {
                    object: format!("exporting cluster or service {}", source),
                }
                .into())
            }
        };
        if exporter_cluster == cluster_id {
            return Err(ConductorError::NameConflict {
                kind: "bind".to_string(),
                name: format!("{} cannot import from its own cluster", importer.name),
            }
            .into());
        }

        let exporter_prototype = self.catalog.prototype(exporter.prototype_id).await?;
        let importer_prototype = self.catalog.prototype(importer.prototype_id).await?;
        let Some(import) = importer_prototype.spec.import.get(&exporter_prototype.name) else {
            return Err(ConductorError::PrototypeNotFound {
                name: format!("import of {} in {}", exporter_prototype.name, importer_prototype.name),
            }
            .into());
        };

        let exporter_bundle = self.catalog.get_bundle(exporter_prototype.bundle_id).await?;
        if !version::within(&exporter_bundle.version, &import.versions) {
            return Err(ConductorError::Upgrade {
                reason: format!(
                    "{} version {} is outside the import bounds of {}",
                    exporter_prototype.name, exporter_bundle.version, importer.name
                ),
            }
            .into());
        }

        if !import.multibind {
            for existing in self.db.list_binds(cluster_id).await? {
                if existing.service_id != service_id {
                    continue;
                }
                let Some(bound) = self.db.get_object(existing.source).await? else {
                    continue;
                };
                if self.catalog.prototype(bound.prototype_id).await?.name == exporter_prototype.name {
                    return Err(ConductorError::NameConflict {
                        kind: "bind".to_string(),
                        name: format!("{} is already bound to {}", importer.name, bound.name),
                    }
                    .into());
                }
            }
        }

        let bind_id = self.db.insert_bind(cluster_id, service_id, source).await?;
        self.concerns.refresh_cluster(cluster_id).await?;
        info!("{} bound to {} (#{})", importer.name, exporter.name, bind_id);
        Ok(bind_id)
    }

    pub async fn list_binds(&self, cluster_id: i64) -> Result<Vec<BindRecord>> {
        self.db.list_binds(cluster_id).await
    }

    pub async fn unbind(&self, cluster_id: i64, bind_id: i64) -> Result<()> {
        self.db.delete_bind(bind_id).await?;
        self.concerns.refresh_cluster(cluster_id).await
    }

    // ========================================================================
    // Host groups
    // ========================================================================

    /// Hosts allowed into a host group of `owner`
    async fn group_candidates(&self, owner: &ObjectRecord) -> Result<BTreeSet<i64>> {
        let cluster_id = match owner.object_type {
            ObjectType::Cluster => owner.id,
            _ => match owner.cluster_id {
                Some(cluster_id) => cluster_id,
                None => return Ok(BTreeSet::new()),
            },
        };
        let topology = self.topology.retrieve_topology(cluster_id).await?;
        Ok(match owner.object_type {
            ObjectType::Cluster => topology.hosts.keys().copied().collect(),
            ObjectType::Service => topology
                .services
                .get(&owner.id)
                .map(|s| s.hosts())
                .unwrap_or_default(),
            ObjectType::Component => topology
                .component(owner.id)
                .map(|(_, c)| c.hosts.clone())
                .unwrap_or_default(),
            _ => BTreeSet::new(),
        })
    }

    pub async fn create_config_group(&self, owner: ObjectRef, name: &str, description: &str) -> Result<i64> {
        let record = self.db.require_object(owner).await?;
        if !matches!(
            record.object_type,
            ObjectType::Cluster | ObjectType::Service | ObjectType::Component
        ) {
            return Err(ConductorError::ObjectNotFound {
                object: format!("config group owner {}", owner),
            }
            .into());
        }
        let root_id = self.config.init_group_config(owner).await?;
        self.db
            .create_host_group(HostGroupKind::Config, owner, name, description, Some(root_id))
            .await
    }

    pub async fn create_action_group(&self, owner: ObjectRef, name: &str, description: &str) -> Result<i64> {
        let record = self.db.require_object(owner).await?;
        if !matches!(
            record.object_type,
            ObjectType::Cluster | ObjectType::Service | ObjectType::Component
        ) {
            return Err(ConductorError::ObjectNotFound {
                object: format!("action group owner {}", owner),
            }
            .into());
        }
        self.db
            .create_host_group(HostGroupKind::Action, owner, name, description, None)
            .await
    }

    pub async fn get_host_group(&self, group_id: i64) -> Result<HostGroupRecord> {
        self.db.get_host_group(group_id).await?.ok_or_else(|| {
            ConductorError::ObjectNotFound {
                object: format!("host group #{}", group_id),
            }
            .into()
        })
    }

    /// Add a host to a group; it must be a candidate of the group owner and,
    /// for config groups, not a member of another config group of that owner
    pub async fn add_group_host(&self, group_id: i64, host_id: i64) -> Result<()> {
        let group = self.get_host_group(group_id).await?;
        let owner = self.db.require_object(group.owner).await?;
        let host = self.db.require_object(ObjectRef::host(host_id)).await?;

        if !self.group_candidates(&owner).await?.contains(&host_id) {
            return Err(ConductorError::ForeignHost {
                host: host.name,
                cluster: owner.name,
            }
            .into());
        }
        if group.kind == HostGroupKind::Config {
            let taken = self
                .db
                .list_config_groups_for_host(host_id)
                .await?
                .into_iter()
                .any(|g| g.owner == group.owner && g.id != group_id);
            if taken {
                return Err(ConductorError::HostConflict {
                    host: host.name,
                    reason: format!("already in another config group of {}", owner.name),
                }
                .into());
            }
        }
        self.db.add_host_to_group(group_id, host_id).await
    }

    pub async fn remove_group_host(&self, group_id: i64, host_id: i64) -> Result<()> {
        self.get_host_group(group_id).await?;
        self.db.remove_host_from_group(group_id, host_id).await
    }

    pub async fn delete_host_group(&self, group_id: i64) -> Result<()> {
        self.get_host_group(group_id).await?;
        self.db.delete_host_group(group_id).await
    }

    // ========================================================================
    // Maintenance mode
    // ========================================================================

    /// Write a maintenance-mode value and announce it
    pub async fn apply_maintenance_mode(&self, object: ObjectRef, value: MaintenanceMode) -> Result<()> {
        let record = self.db.require_object(object).await?;
        self.db.update_maintenance_mode(object, value).await?;
        self.events.publish(DomainEvent::MaintenanceModeChanged { object, value });
        self.events
            .object_updated(object, json!({"maintenance_mode": value}));
        if let Some(cluster_id) = record.cluster_id {
            self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        }
        Ok(())
    }
}

fn validate_fqdn(fqdn: &str) -> Result<()> {
    let valid = !fqdn.is_empty()
        && fqdn.len() <= 253
        && !fqdn.starts_with(['-', '.'])
        && fqdn
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(ConductorError::ConfigValue {
            key: "fqdn".to_string(),
            reason: format!("'{}' is not a valid host name", fqdn),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("h1", true)]
    #[case("node-1.example.com", true)]
    #[case("", false)]
    #[case("-bad", false)]
    #[case("with space", false)]
    fn test_validate_fqdn(#[case] fqdn: &str, #[case] ok: bool) {
        assert_eq!(validate_fqdn(fqdn).is_ok(), ok);
    }
}
