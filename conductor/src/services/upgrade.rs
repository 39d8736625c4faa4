// File: conductor/src/services/upgrade.rs
//! Bundle upgrades: availability, `bundle_switch` and `bundle_revert`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::catalog::definition::PrototypeType;
use crate::catalog::{version, Catalog};
use crate::concerns::ConcernService;
use crate::database::{
    Database, NewObject, ObjectRecord, ObjectRef, ObjectType, PrototypeRecord, UpgradeRecord,
};
use crate::errors::ConductorError;
use crate::events::{DomainEvent, EventBus};
use crate::params::ConfigService;
use crate::topology::TopologyService;

/// What `bundle_revert` needs to put an object back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeforeUpgrade {
    pub state: String,
    pub bundle_id: i64,
    pub prototype_id: i64,
    pub config_id: Option<i64>,
}

pub struct UpgradeService {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    config: Arc<ConfigService>,
    topology: Arc<TopologyService>,
    concerns: Arc<ConcernService>,
    events: EventBus,
}

fn upgrade_error(reason: String) -> anyhow::Error {
    ConductorError::Upgrade { reason }.into()
}

impl UpgradeService {
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

    /// Why `upgrade` cannot be applied to `object`, if it cannot
    pub async fn check_upgrade(&self, object: &ObjectRecord, upgrade: &UpgradeRecord) -> Result<()> {
        if !matches!(object.object_type, ObjectType::Cluster | ObjectType::Provider) {
            return Err(upgrade_error(format!("{} cannot be upgraded", object.object_ref())));
        }
        let prototype = self.catalog.prototype(object.prototype_id).await?;
        let current = self.catalog.get_bundle(prototype.bundle_id).await?;
        let target = self.catalog.get_bundle(upgrade.bundle_id).await?;

        if target.id == current.id {
            return Err(upgrade_error(format!("{} already uses bundle {} {}", object.name, target.name, target.version)));
        }
        if target.name != current.name {
            return Err(upgrade_error(format!(
                "bundle {} cannot upgrade {} from bundle {}",
                target.name, object.name, current.name
            )));
        }
        if !version::within(&current.version, &upgrade.spec.versions) {
            return Err(upgrade_error(format!(
                "version {} of {} is outside the bounds of upgrade {}",
                current.version, object.name, upgrade.name
            )));
        }
        if !upgrade.spec.from_edition.contains(&current.edition) {
            return Err(upgrade_error(format!(
                "edition {} is not accepted by upgrade {}",
                current.edition, upgrade.name
            )));
        }
        if !upgrade.spec.states.available.contains(&object.state) {
            return Err(upgrade_error(format!(
                "upgrade {} is not available in state {}",
                upgrade.name, object.state
            )));
        }
        Ok(())
    }

    /// Upgrades applicable to an object, lowest version bound first
    pub async fn list_available(&self, object: ObjectRef) -> Result<Vec<UpgradeRecord>> {
        let record = self.db.require_object(object).await?;
        let mut available = Vec::new();
        for upgrade in self.db.list_all_upgrades().await? {
            if self.check_upgrade(&record, &upgrade).await.is_ok() {
                available.push(upgrade);
            }
        }
        available.sort_by(|a, b| {
            let left = a.spec.versions.min.as_deref().or(a.spec.versions.min_strict.as_deref());
            let right = b.spec.versions.min.as_deref().or(b.spec.versions.min_strict.as_deref());
            version::compare(left.unwrap_or("0"), right.unwrap_or("0")).then_with(|| a.name.cmp(&b.name))
        });
        Ok(available)
    }

    /// Apply an upgrade that declares no scripts
    #[instrument(skip(self))]
    pub async fn apply_upgrade(&self, object: ObjectRef, upgrade_id: i64) -> Result<()> {
        let record = self.db.require_object(object).await?;
        let upgrade = self.catalog.get_upgrade(upgrade_id).await?;
        self.check_upgrade(&record, &upgrade).await?;
        if upgrade.action_id.is_some() {
            return Err(upgrade_error(format!(
                "upgrade {} runs as an action and must be launched as one",
                upgrade.name
            )));
        }
        self.concerns.check_not_blocked(object, None).await?;

        self.bundle_switch(object, upgrade.bundle_id).await?;
        if let Some(state) = &upgrade.spec.states.on_success {
            self.db.update_state(object, state).await?;
            self.events.object_updated(object, json!({"state": state}));
        }
        info!("Upgrade {} applied to {}", upgrade.name, record.name);
        Ok(())
    }

    async fn target_prototype(
        &self,
        bundle_id: i64,
        current: &PrototypeRecord,
        parent_name: Option<&str>,
    ) -> Result<Option<Arc<PrototypeRecord>>> {
        self.catalog
            .get_prototype(bundle_id, current.prototype_type, &current.name, parent_name)
            .await
    }

    /// Rebind one object to a prototype, remembering how to go back
    async fn switch_object(&self, object: &ObjectRecord, old: &PrototypeRecord, new_prototype_id: i64) -> Result<()> {
        let owner = object.object_ref();
        let config_id = self.config.migrate_config(owner, new_prototype_id).await?;
        let before = BeforeUpgrade {
            state: object.state.clone(),
            bundle_id: old.bundle_id,
            prototype_id: old.id,
            config_id,
        };
        self.db.update_prototype(owner, new_prototype_id).await?;
        self.db
            .set_before_upgrade(owner, Some(&serde_json::to_value(&before)?))
            .await?;
        self.events
            .object_updated(owner, json!({"prototype_id": new_prototype_id}));
        Ok(())
    }

    async fn create_component(&self, cluster_id: i64, service_id: i64, prototype: &PrototypeRecord) -> Result<()> {
        let id = self
            .db
            .insert_object(&NewObject {
                object_type: ObjectType::Component,
                prototype_id: prototype.id,
                name: prototype.name.clone(),
                description: String::new(),
                parent_id: Some(service_id),
                cluster_id: Some(cluster_id),
                config_root_id: None,
            })
            .await?;
        let owner = ObjectRef::component(id);
        let schema = prototype.spec.config.clone().unwrap_or_default();
        if let Some(root_id) = self.config.init_config(owner, &schema).await? {
            self.db.set_config_root(owner, root_id).await?;
        }
        Ok(())
    }

    /// Drop objects from the mapping and the store
    async fn remove_from_cluster(&self, cluster_id: i64, objects: &[ObjectRef]) -> Result<()> {
        if objects.is_empty() {
            return Ok(());
        }
        let current = self.db.get_hostcomponents(cluster_id).await?;
        let remaining: BTreeSet<_> = current
            .iter()
            .filter(|e| {
                !objects.contains(&ObjectRef::service(e.service_id))
                    && !objects.contains(&ObjectRef::component(e.component_id))
            })
            .copied()
            .collect();
        if remaining.len() != current.len() {
            self.topology.commit_mapping(cluster_id, &remaining).await?;
            self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        }
        for object in objects {
            self.db.delete_object(*object).await?;
        }
        Ok(())
    }

    /// Move a cluster (with services and components) or a provider (with
    /// hosts) onto the prototypes of `target_bundle_id`.
    ///
    /// Services and components missing from the target bundle are removed;
    /// components new in the target bundle are created.
    #[instrument(skip(self))]
    pub async fn bundle_switch(&self, object: ObjectRef, target_bundle_id: i64) -> Result<()> {
        let record = self.db.require_object(object).await?;
        let prototype = self.catalog.prototype(record.prototype_id).await?;
        let Some(target) = self.target_prototype(target_bundle_id, &prototype, None).await? else {
            return Err(upgrade_error(format!(
                "bundle #{} has no {} prototype {}",
                target_bundle_id,
                prototype.prototype_type.as_str(),
                prototype.name
            )));
        };

        match record.object_type {
            ObjectType::Cluster => self.switch_cluster_children(&record, target_bundle_id).await?,
            ObjectType::Provider => {
                for host in self.db.list_children(ObjectType::Host, record.id).await? {
                    let host_prototype = self.catalog.prototype(host.prototype_id).await?;
                    let next = self
                        .catalog
                        .list_prototypes(target_bundle_id)
                        .await?
                        .into_iter()
                        .find(|p| p.prototype_type == PrototypeType::Host);
                    match next {
                        Some(next) => self.switch_object(&host, &host_prototype, next.id).await?,
                        None => warn!("Bundle #{} has no host prototype, {} kept", target_bundle_id, host.name),
                    }
                }
            }
            _ => return Err(upgrade_error(format!("{} cannot be upgraded", object))),
        }

        self.switch_object(&record, &prototype, target.id).await?;
        self.concerns.refresh_object(object).await?;
        info!("{} switched to bundle #{}", record.name, target_bundle_id);
        Ok(())
    }

    async fn switch_cluster_children(&self, cluster: &ObjectRecord, bundle_id: i64) -> Result<()> {
        let mut removed = Vec::new();

        for service in self.db.list_children(ObjectType::Service, cluster.id).await? {
            let service_prototype = self.catalog.prototype(service.prototype_id).await?;
            let components = self.db.list_children(ObjectType::Component, service.id).await?;

            let Some(next) = self.target_prototype(bundle_id, &service_prototype, None).await? else {
                info!("Service {} is not in bundle #{}, removing", service.name, bundle_id);
                removed.extend(components.iter().map(|c| c.object_ref()));
                removed.push(service.object_ref());
                continue;
            };
            self.switch_object(&service, &service_prototype, next.id).await?;

            let mut kept = BTreeSet::new();
            for component in components {
                let component_prototype = self.catalog.prototype(component.prototype_id).await?;
                match self
                    .target_prototype(bundle_id, &component_prototype, Some(&service_prototype.name))
                    .await?
                {
                    Some(next_component) => {
                        kept.insert(component_prototype.name.clone());
                        self.switch_object(&component, &component_prototype, next_component.id)
                            .await?;
                    }
                    None => removed.push(component.object_ref()),
                }
            }
            for component in self.catalog.list_components(next.id).await? {
                if !kept.contains(&component.name) {
                    self.create_component(cluster.id, service.id, &component).await?;
                }
            }
        }

        self.remove_from_cluster(cluster.id, &removed).await
    }

    /// Put an upgraded object (and its children) back on the prototypes
    /// recorded by the last `bundle_switch`
    #[instrument(skip(self))]
    pub async fn bundle_revert(&self, object: ObjectRef) -> Result<()> {
        let record = self.db.require_object(object).await?;
        if record.before_upgrade.is_none() {
            return Err(upgrade_error(format!("{} has no upgrade to revert", record.name)));
        }

        match record.object_type {
            ObjectType::Cluster => {
                let mut removed = Vec::new();
                for service in self.db.list_children(ObjectType::Service, record.id).await? {
                    for component in self.db.list_children(ObjectType::Component, service.id).await? {
                        if component.before_upgrade.is_some() {
                            self.revert_object(&component).await?;
                        } else {
                            removed.push(component.object_ref());
                        }
                    }
                    self.revert_object(&service).await?;
                }
                self.remove_from_cluster(record.id, &removed).await?;
            }
            ObjectType::Provider => {
                for host in self.db.list_children(ObjectType::Host, record.id).await? {
                    self.revert_object(&host).await?;
                }
            }
            _ => {}
        }
        self.revert_object(&record).await?;
        self.concerns.refresh_object(object).await?;
        info!("{} reverted to its previous bundle", record.name);
        Ok(())
    }

    async fn revert_object(&self, object: &ObjectRecord) -> Result<()> {
        let Some(raw) = &object.before_upgrade else {
            return Ok(());
        };
        let before: BeforeUpgrade = serde_json::from_value(raw.clone())?;
        let owner = object.object_ref();

        self.db.update_prototype(owner, before.prototype_id).await?;
        if let Some(config_id) = before.config_id {
            self.config.reinstate_config(owner, config_id).await?;
        }
        self.db.update_state(owner, &before.state).await?;
        self.db.set_before_upgrade(owner, None).await?;
        self.events.object_updated(
            owner,
            json!({"prototype_id": before.prototype_id, "state": before.state}),
        );
        Ok(())
    }
}
