//! Cluster topology snapshots and the mapping write path.
//!
//! A `Topology` is rebuilt from the store per request and consumed by value;
//! nothing downstream fetches lazily from it.

pub mod constraint;
pub mod mapping;

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::catalog::Catalog;
use crate::database::{
    Database, HcDelta, HcEntry, MaintenanceMode, ObjectRecord, ObjectRef, ObjectType,
    PrototypeRecord,
};
use crate::errors::ConductorError;

#[derive(Debug, Clone)]
pub struct ComponentView {
    pub component: ObjectRecord,
    pub prototype: Arc<PrototypeRecord>,
    pub hosts: BTreeSet<i64>,
}

#[derive(Debug, Clone)]
pub struct ServiceView {
    pub service: ObjectRecord,
    pub prototype: Arc<PrototypeRecord>,
    pub components: BTreeMap<i64, ComponentView>,
}

impl ServiceView {
    pub fn component_by_name(&self, name: &str) -> Option<&ComponentView> {
        self.components
            .values()
            .find(|c| c.prototype.name == name)
    }

    pub fn hosts(&self) -> BTreeSet<i64> {
        self.components
            .values()
            .flat_map(|c| c.hosts.iter().copied())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct HostView {
    pub host: ObjectRecord,
    /// Component ids mapped on this host
    pub components: BTreeSet<i64>,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub cluster: ObjectRecord,
    pub cluster_prototype: Arc<PrototypeRecord>,
    pub services: BTreeMap<i64, ServiceView>,
    /// Every host attached to the cluster, mapped or not
    pub hosts: BTreeMap<i64, HostView>,
    pub hostcomponent: BTreeSet<HcEntry>,
}

impl Topology {
    pub fn service_by_name(&self, name: &str) -> Option<&ServiceView> {
        self.services.values().find(|s| s.prototype.name == name)
    }

    pub fn component(&self, component_id: i64) -> Option<(&ServiceView, &ComponentView)> {
        self.services.values().find_map(|service| {
            service
                .components
                .get(&component_id)
                .map(|component| (service, component))
        })
    }

    pub fn component_by_name(
        &self,
        service_name: &str,
        component_name: &str,
    ) -> Option<(&ServiceView, &ComponentView)> {
        let service = self.service_by_name(service_name)?;
        let component = service.component_by_name(component_name)?;
        Some((service, component))
    }

    pub fn host_by_fqdn(&self, fqdn: &str) -> Option<&HostView> {
        self.hosts.values().find(|h| h.host.name == fqdn)
    }

    pub fn fqdn(&self, host_id: i64) -> String {
        self.hosts
            .get(&host_id)
            .map(|h| h.host.name.clone())
            .unwrap_or_else(|| format!("host #{}", host_id))
    }

    pub fn host_mm(&self, host_id: i64) -> MaintenanceMode {
        self.hosts
            .get(&host_id)
            .map(|h| h.host.maintenance_mode)
            .unwrap_or_default()
    }

    pub fn service_mm(&self, service_id: i64) -> MaintenanceMode {
        let own = self
            .services
            .get(&service_id)
            .map(|s| s.service.maintenance_mode)
            .unwrap_or_default();
        own.max(self.cluster.maintenance_mode)
    }

    /// max(own, service, cluster) under OFF < CHANGING < ON
    pub fn component_mm(&self, component_id: i64) -> MaintenanceMode {
        match self.component(component_id) {
            Some((service, component)) => component
                .component
                .maintenance_mode
                .max(self.service_mm(service.service.id)),
            None => MaintenanceMode::Off,
        }
    }

    /// Effective MM of any object in the cluster
    pub fn effective_mm(&self, object: ObjectRef) -> MaintenanceMode {
        match object.object_type {
            ObjectType::Host => self.host_mm(object.id),
            ObjectType::Service => self.service_mm(object.id),
            ObjectType::Component => self.component_mm(object.id),
            ObjectType::Cluster => self.cluster.maintenance_mode,
            _ => MaintenanceMode::Off,
        }
    }

    /// Mapping as (host, component) pairs
    pub fn pairs(&self) -> BTreeSet<(i64, i64)> {
        self.hostcomponent
            .iter()
            .map(|e| (e.host_id, e.component_id))
            .collect()
    }

    /// Same topology with `entries` as the mapping
    pub fn with_mapping(&self, entries: &BTreeSet<HcEntry>) -> Topology {
        let mut next = self.clone();
        for service in next.services.values_mut() {
            for component in service.components.values_mut() {
                component.hosts.clear();
            }
        }
        for host in next.hosts.values_mut() {
            host.components.clear();
        }
        for entry in entries {
            if let Some(service) = next.services.get_mut(&entry.service_id) {
                if let Some(component) = service.components.get_mut(&entry.component_id) {
                    component.hosts.insert(entry.host_id);
                }
            }
            if let Some(host) = next.hosts.get_mut(&entry.host_id) {
                host.components.insert(entry.component_id);
            }
        }
        next.hostcomponent = entries.clone();
        next
    }

    /// Every object of the cluster, cluster first
    pub fn objects(&self) -> Vec<ObjectRef> {
        let mut objects = vec![self.cluster.object_ref()];
        for service in self.services.values() {
            objects.push(service.service.object_ref());
            for component in service.components.values() {
                objects.push(component.component.object_ref());
            }
        }
        objects.extend(self.hosts.keys().map(|id| ObjectRef::host(*id)));
        objects
    }
}

pub struct TopologyService {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
}

impl TopologyService {
    pub fn new(db: Arc<Database>, catalog: Arc<Catalog>) -> Self {
        Self { db, catalog }
    }

    pub async fn retrieve_topology(&self, cluster_id: i64) -> Result<Topology> {
        let cluster = self.db.require_object(ObjectRef::cluster(cluster_id)).await?;
        let cluster_prototype = self.catalog.prototype(cluster.prototype_id).await?;
        let hostcomponent = self.db.get_hostcomponents(cluster_id).await?;

        let mut services = BTreeMap::new();
        for service in self.db.list_children(ObjectType::Service, cluster_id).await? {
            let prototype = self.catalog.prototype(service.prototype_id).await?;
            let mut components = BTreeMap::new();
            for component in self.db.list_children(ObjectType::Component, service.id).await? {
                let component_prototype = self.catalog.prototype(component.prototype_id).await?;
                let hosts = hostcomponent
                    .iter()
                    .filter(|e| e.component_id == component.id)
                    .map(|e| e.host_id)
                    .collect();
                components.insert(
                    component.id,
                    ComponentView {
                        component,
                        prototype: component_prototype,
                        hosts,
                    },
                );
            }
            services.insert(
                service.id,
                ServiceView {
                    service,
                    prototype,
                    components,
                },
            );
        }

        let mut hosts = BTreeMap::new();
        for host in self.db.list_in_cluster(ObjectType::Host, cluster_id).await? {
            let components = hostcomponent
                .iter()
                .filter(|e| e.host_id == host.id)
                .map(|e| e.component_id)
                .collect();
            hosts.insert(host.id, HostView { host, components });
        }

        Ok(Topology {
            cluster,
            cluster_prototype,
            services,
            hosts,
            hostcomponent,
        })
    }

    /// Attach a host to a cluster; a host already in another cluster is a conflict
    #[instrument(skip(self))]
    pub async fn attach_host(&self, host_id: i64, cluster_id: i64) -> Result<()> {
        let host = self.db.require_object(ObjectRef::host(host_id)).await?;
        let cluster = self.db.require_object(ObjectRef::cluster(cluster_id)).await?;

        match host.cluster_id {
            Some(current) if current == cluster_id => return Ok(()),
            Some(current) => {
                return Err(ConductorError::HostConflict {
                    host: host.name,
                    reason: format!("already belongs to cluster #{}", current),
                }
                .into())
            }
            None => {}
        }

        self.db.set_host_cluster(host_id, Some(cluster_id)).await?;
        info!("Host {} attached to cluster {}", host.name, cluster.name);
        Ok(())
    }

    /// Detach a host from its cluster; refused while it is still mapped
    #[instrument(skip(self))]
    pub async fn detach_host(&self, host_id: i64) -> Result<Option<i64>> {
        let host = self.db.require_object(ObjectRef::host(host_id)).await?;
        let Some(cluster_id) = host.cluster_id else {
            return Ok(None);
        };

        if self.db.host_is_mapped(host_id).await? {
            return Err(ConductorError::HostConflict {
                host: host.name,
                reason: "still has mapped components".to_string(),
            }
            .into());
        }

        self.db.set_host_cluster(host_id, None).await?;
        self.db.remove_host_from_all_groups(host_id).await?;
        info!("Host {} detached from cluster #{}", host.name, cluster_id);
        Ok(Some(cluster_id))
    }

    /// Validate a desired mapping and compute the delta against the current one
    pub async fn preview_mapping(
        &self,
        cluster_id: i64,
        desired: &BTreeSet<(i64, i64)>,
    ) -> Result<(Topology, HcDelta)> {
        let topology = self.retrieve_topology(cluster_id).await?;
        let entries = mapping::check_mapping(&topology, desired)?;
        let delta = HcDelta::between(&topology.hostcomponent, &entries);
        Ok((topology, delta))
    }

    /// Replace the cluster mapping atomically: all of `desired` or nothing
    #[instrument(skip(self, desired), fields(entries = desired.len()))]
    pub async fn set_mapping(
        &self,
        cluster_id: i64,
        desired: &BTreeSet<(i64, i64)>,
    ) -> Result<HcDelta> {
        let (_, delta) = self.preview_mapping(cluster_id, desired).await?;
        self.db
            .replace_hostcomponents(cluster_id, &delta.desired())
            .await?;
        Ok(delta)
    }

    /// Write an already validated mapping (task commit, plugin change_hc)
    pub async fn commit_mapping(&self, cluster_id: i64, entries: &BTreeSet<HcEntry>) -> Result<()> {
        self.db.replace_hostcomponents(cluster_id, entries).await
    }
}
