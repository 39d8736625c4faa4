//! Per-job Ansible-style inventory.
//!
//! Output shape: `{all: {children: {<group>: {hosts: {<fqdn>: vars}, vars}}}}`.
//! Secret leaves are written to files under the job's secrets dir and the
//! inventory carries their paths; plaintext never ends up in the tree.

pub mod groups;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::catalog::definition::PrototypeType;
use crate::catalog::Catalog;
use crate::constants::jobs::SECRETS_DIR;
use crate::database::{
    Database, HcDelta, MaintenanceMode, ObjectRecord, ObjectRef, ObjectType, TaskRecord,
    TaskTarget,
};
use crate::params::files::FileScope;
use crate::params::schema::FieldType;
use crate::params::ConfigService;
use crate::topology::{Topology, TopologyService};
use groups::{HostGroups, HOST_GROUP, PROVIDER_GROUP, TARGET_GROUP};

/// Where secret leaves go while building variables
#[derive(Debug, Clone, Copy)]
pub enum SecretSink<'a> {
    /// Leave secret leaves sealed (template rendering)
    Sealed,
    /// Decrypt into files under this directory; the leaf becomes the path
    Files(&'a Path),
}

pub struct InventoryBuilder {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    config: Arc<ConfigService>,
    topology: Arc<TopologyService>,
}

impl InventoryBuilder {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        config: Arc<ConfigService>,
        topology: Arc<TopologyService>,
    ) -> Self {
        Self {
            db,
            catalog,
            config,
            topology,
        }
    }

    /// Inventory of one job of `task`, secrets written below `job_dir`
    #[instrument(skip(self, task, job_dir), fields(task_id = task.id))]
    pub async fn build(&self, task: &TaskRecord, job_dir: &Path) -> Result<Value> {
        let secrets_dir = job_dir.join(SECRETS_DIR);
        tokio::fs::create_dir_all(&secrets_dir)
            .await
            .with_context(|| format!("Failed to create {}", secrets_dir.display()))?;
        let sink = SecretSink::Files(&secrets_dir);

        let object = self.db.require_object(task.object).await?;
        let action = self.catalog.action(task.action_id).await?;
        let action_owner = self.catalog.prototype(action.prototype_id).await?;

        let mut children = Map::new();
        match action_owner.prototype_type {
            PrototypeType::Cluster | PrototypeType::Service | PrototypeType::Component => {
                let cluster_id = match object.object_type {
                    ObjectType::Cluster => Some(object.id),
                    _ => object.cluster_id,
                };
                if let Some(cluster_id) = cluster_id {
                    let topology = self.topology.retrieve_topology(cluster_id).await?;
                    let mut host_groups =
                        groups::cluster_groups(&topology, task.hostcomponent.as_ref());
                    if object.object_type == ObjectType::Host {
                        host_groups.entry(HOST_GROUP.to_string()).or_default().insert(object.id);
                    }
                    self.add_target_group(task, &object, &mut host_groups).await?;

                    let (cluster, services) = self.cluster_vars(&topology, sink).await?;
                    let vars = json!({"cluster": cluster, "services": services});
                    self.render_groups(&mut children, &host_groups, &vars, Some(&topology), sink)
                        .await?;
                }
            }
            PrototypeType::Provider => {
                let provider_vars = self.provider_vars(&object, sink).await?;
                let mut host_groups = HostGroups::new();
                let hosts = self.db.list_children(ObjectType::Host, object.id).await?;
                if !hosts.is_empty() {
                    host_groups.insert(
                        PROVIDER_GROUP.to_string(),
                        hosts.iter().map(|h| h.id).collect(),
                    );
                }
                let vars = json!({"provider": provider_vars});
                self.render_groups(&mut children, &host_groups, &vars, None, sink)
                    .await?;
            }
            PrototypeType::Host | PrototypeType::Adcm => {
                let mut vars = Map::new();
                let mut topology = None;
                if object.object_type == ObjectType::Host {
                    if let Some(provider_id) = object.parent_id {
                        let provider = self.db.require_object(ObjectRef::provider(provider_id)).await?;
                        vars.insert("provider".into(), self.provider_vars(&provider, sink).await?);
                    }
                    if let Some(cluster_id) = object.cluster_id {
                        let cluster_topology = self.topology.retrieve_topology(cluster_id).await?;
                        let (cluster, services) = self.cluster_vars(&cluster_topology, sink).await?;
                        vars.insert("cluster".into(), cluster);
                        vars.insert("services".into(), services);
                        topology = Some(cluster_topology);
                    }
                }
                let mut host_groups = HostGroups::new();
                host_groups.entry(HOST_GROUP.to_string()).or_default().insert(object.id);
                self.render_groups(
                    &mut children,
                    &host_groups,
                    &Value::Object(vars),
                    topology.as_ref(),
                    sink,
                )
                .await?;
            }
        }

        debug!("Inventory for task #{} has {} groups", task.id, children.len());
        Ok(json!({"all": {"children": children}}))
    }

    async fn add_target_group(
        &self,
        task: &TaskRecord,
        object: &ObjectRecord,
        host_groups: &mut HostGroups,
    ) -> Result<()> {
        match task.target {
            TaskTarget::ActionHostGroup { group_id } => {
                if let Some(group) = self.db.get_host_group(group_id).await? {
                    host_groups
                        .entry(TARGET_GROUP.to_string())
                        .or_default()
                        .extend(group.hosts.iter().copied());
                }
            }
            TaskTarget::Object(target) if target.object_type == ObjectType::Host => {
                host_groups
                    .entry(TARGET_GROUP.to_string())
                    .or_default()
                    .insert(object.id);
            }
            TaskTarget::Object(_) => {}
        }
        Ok(())
    }

    async fn render_groups(
        &self,
        children: &mut Map<String, Value>,
        host_groups: &HostGroups,
        vars: &Value,
        topology: Option<&Topology>,
        sink: SecretSink<'_>,
    ) -> Result<()> {
        let mut host_cache: BTreeMap<i64, (String, Value)> = BTreeMap::new();
        for (name, members) in host_groups {
            let mut hosts = Map::new();
            for host_id in members {
                if !host_cache.contains_key(host_id) {
                    let Some(host) = self.db.get_object(ObjectRef::host(*host_id)).await? else {
                        continue;
                    };
                    let host_vars = self.host_vars(&host, topology, sink).await?;
                    host_cache.insert(*host_id, (host.name.clone(), host_vars));
                }
                if let Some((fqdn, host_vars)) = host_cache.get(host_id) {
                    hosts.insert(fqdn.clone(), host_vars.clone());
                }
            }
            children.insert(name.clone(), json!({"hosts": hosts, "vars": vars}));
        }
        Ok(())
    }

    /// `cluster` and `services` variables of a cluster topology
    pub async fn cluster_vars(&self, topology: &Topology, sink: SecretSink<'_>) -> Result<(Value, Value)> {
        let bundle = self.catalog.get_bundle(topology.cluster_prototype.bundle_id).await?;
        let mut cluster = self.object_vars(&topology.cluster, sink).await?;
        if let Some(map) = cluster.as_object_mut() {
            map.insert("version".into(), json!(topology.cluster_prototype.version));
            map.insert("edition".into(), json!(bundle.edition));
        }

        let mut services = Map::new();
        for service in topology.services.values() {
            let mut service_vars = self.object_vars(&service.service, sink).await?;
            let mut components = Map::new();
            for component in service.components.values() {
                let mut component_vars = self.object_vars(&component.component, sink).await?;
                if let Some(map) = component_vars.as_object_mut() {
                    map.insert("display_name".into(), json!(component.prototype.display_name));
                    map.insert(
                        "maintenance_mode".into(),
                        json!(topology.component_mm(component.component.id) == MaintenanceMode::On),
                    );
                }
                components.insert(component.prototype.name.clone(), component_vars);
            }
            if let Some(map) = service_vars.as_object_mut() {
                map.insert("version".into(), json!(service.prototype.version));
                map.insert("display_name".into(), json!(service.prototype.display_name));
                map.insert(
                    "maintenance_mode".into(),
                    json!(topology.service_mm(service.service.id) == MaintenanceMode::On),
                );
                map.insert("components".into(), Value::Object(components));
            }
            services.insert(service.prototype.name.clone(), service_vars);
        }

        Ok((cluster, Value::Object(services)))
    }

    pub async fn provider_vars(&self, provider: &ObjectRecord, sink: SecretSink<'_>) -> Result<Value> {
        let prototype = self.catalog.prototype(provider.prototype_id).await?;
        let host_prototype_id = self
            .catalog
            .list_prototypes(prototype.bundle_id)
            .await?
            .into_iter()
            .find(|p| p.prototype_type == PrototypeType::Host)
            .map(|p| p.id);

        let mut vars = self.object_vars(provider, sink).await?;
        if let Some(map) = vars.as_object_mut() {
            map.insert("host_prototype_id".into(), json!(host_prototype_id));
        }
        Ok(vars)
    }

    /// Common variables: identity, state, before_upgrade and config
    async fn object_vars(&self, object: &ObjectRecord, sink: SecretSink<'_>) -> Result<Value> {
        let config = self.object_config(object, None, FileScope::object(object.object_ref()), sink).await?;
        Ok(json!({
            "id": object.id,
            "name": object.name,
            "state": object.state,
            "multi_state": object.multi_state,
            "before_upgrade": object.before_upgrade.clone().unwrap_or_else(|| json!({"state": null})),
            "config": config,
        }))
    }

    async fn object_config(
        &self,
        object: &ObjectRecord,
        host: Option<i64>,
        scope: FileScope,
        sink: SecretSink<'_>,
    ) -> Result<Value> {
        if object.config_root_id.is_none() {
            return Ok(json!({}));
        }
        let config = self.config.get_effective_config(object.object_ref(), host).await?;
        match sink {
            SecretSink::Sealed => Ok(config),
            SecretSink::Files(dir) => self.externalize(object, config, &scope, dir).await,
        }
    }

    /// Replace secret leaves with files holding their plaintext, and
    /// file leaves with the path of the stored file
    async fn externalize(
        &self,
        object: &ObjectRecord,
        config: Value,
        scope: &FileScope,
        dir: &Path,
    ) -> Result<Value> {
        let schema = self.config.schema_for(object).await?;
        let mut plain = self.config.unsealed(&schema, &config)?;

        for leaf in schema.leaves() {
            let field_type = leaf.field.field_type;
            let Some(value) = leaf.get(&plain).cloned() else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let path = leaf.path();
            if field_type.is_secret() {
                let content = match value {
                    Value::String(text) => text,
                    other => serde_json::to_string(&other)?,
                };
                let file: PathBuf = dir.join(scope.file_name(&path));
                tokio::fs::write(&file, content)
                    .await
                    .with_context(|| format!("Failed to write secret {}", file.display()))?;
                leaf.set(&mut plain, json!(file.to_string_lossy()));
            } else if field_type == FieldType::File {
                let file = self.config.files().path(scope, &path);
                leaf.set(&mut plain, json!(file.to_string_lossy()));
            }
        }
        Ok(plain)
    }

    /// Host entry: id, state, own config on top, config group overrides
    async fn host_vars(
        &self,
        host: &ObjectRecord,
        topology: Option<&Topology>,
        sink: SecretSink<'_>,
    ) -> Result<Value> {
        let mut vars = Map::new();
        let own = self
            .object_config(host, None, FileScope::object(host.object_ref()), sink)
            .await?;
        if let Value::Object(own) = own {
            vars.extend(own);
        }
        vars.insert("adcm_hostid".into(), json!(host.id));
        vars.insert("state".into(), json!(host.state));
        vars.insert("multi_state".into(), json!(host.multi_state));

        if let Some(topology) = topology {
            for group in self.db.list_config_groups_for_host(host.id).await? {
                let Some(owner) = self.db.get_object(group.owner).await? else {
                    continue;
                };
                let scope = FileScope::host_group(group.owner, group.id);
                let config = self.object_config(&owner, Some(host.id), scope, sink).await?;
                insert_override(&mut vars, topology, group.owner, config);
            }
        }
        Ok(Value::Object(vars))
    }

    /// Template `groups` variable: group name to host names
    pub fn template_groups(topology: &Topology, delta: Option<&HcDelta>) -> Value {
        let groups = groups::fqdn_groups(&groups::cluster_groups(topology, delta), topology);
        json!(groups)
    }
}

/// Place a config group override at `cluster.config`,
/// `services.<s>.config` or `services.<s>.components.<c>.config`
fn insert_override(vars: &mut Map<String, Value>, topology: &Topology, owner: ObjectRef, config: Value) {
    let path: Vec<String> = match owner.object_type {
        ObjectType::Cluster if owner.id == topology.cluster.id => vec!["cluster".into()],
        ObjectType::Service => match topology.services.get(&owner.id) {
            Some(service) => vec!["services".into(), service.prototype.name.clone()],
            None => return,
        },
        ObjectType::Component => match topology.component(owner.id) {
            Some((service, component)) => vec![
                "services".into(),
                service.prototype.name.clone(),
                "components".into(),
                component.prototype.name.clone(),
            ],
            None => return,
        },
        _ => return,
    };

    let mut node = vars;
    for key in path {
        let entry = node.entry(key).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Some(next) = entry.as_object_mut() else {
            return;
        };
        node = next;
    }
    node.insert("config".into(), config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::mapping::tests::sample_topology;

    #[test]
    fn test_component_override_path() {
        let topology = sample_topology();
        let mut vars = Map::new();
        insert_override(&mut vars, &topology, ObjectRef::component(22), json!({"x": 1}));
        insert_override(&mut vars, &topology, ObjectRef::cluster(1), json!({"y": 2}));

        assert_eq!(vars["services"]["db"]["components"]["agent"]["config"], json!({"x": 1}));
        assert_eq!(vars["cluster"]["config"], json!({"y": 2}));
    }

    #[test]
    fn test_foreign_owner_ignored() {
        let topology = sample_topology();
        let mut vars = Map::new();
        insert_override(&mut vars, &topology, ObjectRef::service(99), json!({"x": 1}));
        assert!(vars.is_empty());
    }

    #[test]
    fn test_template_groups() {
        let topology = sample_topology();
        let value = InventoryBuilder::template_groups(&topology, None);
        assert_eq!(value["CLUSTER"], json!(["h1", "h2", "h3"]));
    }
}
