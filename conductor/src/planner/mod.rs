//! Action planner: turns a launch request into a CREATED task.
//!
//! Planning is side-effect free until the task row is written. The scheduler
//! calls [`ActionPlanner::revalidate`] again right before a task starts.

pub mod gates;
pub mod hc_acl;
pub mod jinja;

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::catalog::definition::{PrototypeType, SubactionSpec};
use crate::catalog::Catalog;
use crate::concerns::ConcernService;
use crate::config::Config;
use crate::database::{
    ActionRecord, Database, HcDelta, HostGroupKind, MaintenanceMode, NewTask, ObjectRecord,
    ObjectRef, ObjectType, SelectorEntry, TaskRecord, TaskStatus, TaskTarget,
};
use crate::errors::ConductorError;
use crate::events::{DomainEvent, EventBus};
use crate::inventory::{InventoryBuilder, SecretSink};
use crate::params::schema::ConfigDefinition;
use crate::params::ConfigService;
use crate::services::{Authorizer, UpgradeService};
use crate::topology::{mapping, Topology, TopologyService};

/// Operator request to run an action
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub target: TaskTarget,
    pub action_id: i64,
    pub config: Option<Value>,
    pub attr: Option<Value>,
    /// Desired (host, component) mapping to apply on success
    pub hostcomponent: Option<BTreeSet<(i64, i64)>>,
    pub verbose: bool,
    pub user: String,
}

impl LaunchRequest {
    pub fn new(target: impl Into<TaskTarget>, action_id: i64) -> Self {
        Self {
            target: target.into(),
            action_id,
            config: None,
            attr: None,
            hostcomponent: None,
            verbose: false,
            user: "admin".to_string(),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_attr(mut self, attr: Value) -> Self {
        self.attr = Some(attr);
        self
    }

    pub fn with_hostcomponent(mut self, pairs: impl IntoIterator<Item = (i64, i64)>) -> Self {
        self.hostcomponent = Some(pairs.into_iter().collect());
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn by(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }
}

impl From<ObjectRef> for TaskTarget {
    fn from(object: ObjectRef) -> Self {
        TaskTarget::Object(object)
    }
}

/// Everything needed to persist a task
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub action: Arc<ActionRecord>,
    /// Object the task runs on
    pub object: ObjectRecord,
    /// Object whose prototype declares the action; differs for host actions
    pub owner: ObjectRecord,
    pub target: TaskTarget,
    pub config: Option<Value>,
    pub attr: Value,
    pub hostcomponent: Option<HcDelta>,
    pub jobs: Vec<SubactionSpec>,
}

pub struct ActionPlanner {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    config: Arc<ConfigService>,
    topology: Arc<TopologyService>,
    concerns: Arc<ConcernService>,
    upgrades: Arc<UpgradeService>,
    inventory: Arc<InventoryBuilder>,
    authorizer: Arc<dyn Authorizer>,
    settings: Arc<Config>,
    events: EventBus,
    /// Held from the blocking check until the new task's lock is written
    launch_gate: Mutex<()>,
}

fn unavailable(action: &ActionRecord, reason: impl Into<String>) -> anyhow::Error {
    ConductorError::ActionUnavailable {
        action: action.display_name(),
        reason: reason.into(),
    }
    .into()
}

fn cluster_of(object: &ObjectRecord) -> Option<i64> {
    match object.object_type {
        ObjectType::Cluster => Some(object.id),
        _ => object.cluster_id,
    }
}

impl ActionPlanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        config: Arc<ConfigService>,
        topology: Arc<TopologyService>,
        concerns: Arc<ConcernService>,
        upgrades: Arc<UpgradeService>,
        inventory: Arc<InventoryBuilder>,
        authorizer: Arc<dyn Authorizer>,
        settings: Arc<Config>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            catalog,
            config,
            topology,
            concerns,
            upgrades,
            inventory,
            authorizer,
            settings,
            events,
            launch_gate: Mutex::new(()),
        }
    }

    /// Validate a request and persist it as a CREATED task holding its lock
    #[instrument(skip(self, request), fields(action_id = request.action_id, user = %request.user))]
    pub async fn create_task(&self, request: &LaunchRequest) -> Result<TaskRecord> {
        // A competing launch must observe this task's lock in its own check
        let _gate = self.launch_gate.lock().await;
        let plan = self.plan(request).await?;
        let selector = self.selector(&plan.object).await?;

        let new_task = NewTask {
            action_id: plan.action.id,
            object: plan.object.object_ref(),
            target: plan.target,
            config: plan.config.clone(),
            attr: plan.attr.clone(),
            verbose: request.verbose,
            hostcomponent: plan.hostcomponent.clone(),
            selector,
            owner_user: request.user.clone(),
        };
        let task_id = self.db.create_task(&new_task, &plan.jobs).await?;
        let task = self.db.get_task(task_id).await?.ok_or_else(|| ConductorError::Internal {
            reason: format!("task #{} vanished after creation", task_id),
        })?;

        if plan.action.spec.blocking {
            self.concerns
                .acquire_task_lock(&task, &plan.action.display_name())
                .await?;
        }

        info!(
            "Task #{} created: {} on {} ({} jobs)",
            task.id,
            plan.action.name,
            plan.object.name,
            plan.jobs.len()
        );
        self.events.publish(DomainEvent::TaskStatus {
            task_id: task.id,
            object: task.object,
            status: TaskStatus::Created,
        });
        Ok(task)
    }

    /// All request checks, in order; nothing is written
    pub async fn plan(&self, request: &LaunchRequest) -> Result<TaskPlan> {
        let action = self.catalog.action(request.action_id).await?;
        let (object, owner) = self.resolve(request.target, &action).await?;

        if !self
            .authorizer
            .can_run(&request.user, object.object_ref(), &action.name)
            .await?
        {
            return Err(ConductorError::Authorization {
                user: request.user.clone(),
                action: action.name.clone(),
            }
            .into());
        }

        gates::check_available(&action.spec, &owner.state, &owner.multi_state)
            .map_err(|reason| unavailable(&action, reason))?;

        self.concerns.check_not_blocked(object.object_ref(), None).await?;
        if owner.object_ref() != object.object_ref() {
            self.concerns.check_not_blocked(owner.object_ref(), None).await?;
        }
        self.check_members_not_blocked(request.target, None).await?;

        let topology = match cluster_of(&object) {
            Some(cluster_id) => Some(self.topology.retrieve_topology(cluster_id).await?),
            None => None,
        };
        self.check_maintenance(&action, &object, request.target, topology.as_ref())
            .await?;

        let hostcomponent = match &request.hostcomponent {
            Some(desired) => Some(self.hc_delta(&action, &object, desired).await?),
            None => None,
        };

        let needs_templates =
            action.spec.scripts_jinja.is_some() || action.spec.config_jinja.is_some();
        let mut context = if needs_templates {
            self.template_context(&action, &owner, topology.as_ref(), hostcomponent.as_ref(), request.verbose)
                .await?
        } else {
            Value::Null
        };

        let schema = match &action.spec.config_jinja {
            Some(template) => {
                let source = self.read_template(&action, template).await?;
                jinja::render_config(&source, &context)?
            }
            None => action.spec.config.clone().unwrap_or_default(),
        };
        let (config, attr) = self.action_config(&schema, request)?;

        let jobs = match &action.spec.scripts_jinja {
            Some(template) => {
                if let Some(task) = context.get_mut("task") {
                    task["config"] = config.clone().unwrap_or(Value::Null);
                }
                let source = self.read_template(&action, template).await?;
                jinja::render_scripts(&source, &context)?
            }
            None => action.spec.static_subactions(&action.name),
        };
        if jobs.is_empty() {
            return Err(ConductorError::TaskGenerator {
                reason: format!("action {} has no scripts to run", action.name),
            }
            .into());
        }

        debug!("Planned {} with {} jobs on {}", action.name, jobs.len(), object.name);
        Ok(TaskPlan {
            action,
            object,
            owner,
            target: request.target,
            config,
            attr,
            hostcomponent,
            jobs,
        })
    }

    /// Checks that may have changed since the task was created
    pub async fn revalidate(&self, task: &TaskRecord) -> Result<()> {
        let action = self.catalog.action(task.action_id).await?;
        let (object, owner) = self.resolve(task.target, &action).await?;

        gates::check_available(&action.spec, &owner.state, &owner.multi_state)
            .map_err(|reason| unavailable(&action, reason))?;
        self.concerns
            .check_not_blocked(object.object_ref(), Some(task.id))
            .await?;
        self.check_members_not_blocked(task.target, Some(task.id))
            .await?;

        let topology = match cluster_of(&object) {
            Some(cluster_id) => Some(self.topology.retrieve_topology(cluster_id).await?),
            None => None,
        };
        self.check_maintenance(&action, &object, task.target, topology.as_ref())
            .await?;

        if let (Some(delta), Some(topology)) = (&task.hostcomponent, &topology) {
            let desired = delta
                .desired()
                .iter()
                .map(|e| (e.host_id, e.component_id))
                .collect();
            mapping::check_mapping(topology, &desired)?;
        }
        Ok(())
    }

    /// Task object and action owner for a target.
    ///
    /// Host actions declared on a cluster, service or component run on a
    /// host but are gated on the matching object of the host's cluster.
    async fn resolve(&self, target: TaskTarget, action: &ActionRecord) -> Result<(ObjectRecord, ObjectRecord)> {
        let object_ref = match target {
            TaskTarget::Object(object) => object,
            TaskTarget::ActionHostGroup { group_id } => {
                let group = self
                    .db
                    .get_host_group(group_id)
                    .await?
                    .filter(|g| g.kind == HostGroupKind::Action)
                    .ok_or_else(|| ConductorError::ObjectNotFound {
                        object: format!("action host group #{}", group_id),
                    })?;
                if !action.spec.allow_for_action_host_group {
                    return Err(unavailable(action, "not allowed for action host groups"));
                }
                if group.hosts.is_empty() {
                    return Err(unavailable(action, format!("host group {} is empty", group.name)));
                }
                group.owner
            }
        };
        let object = self.db.require_object(object_ref).await?;

        if let Some(upgrade_id) = action.upgrade_id {
            let upgrade = self.catalog.get_upgrade(upgrade_id).await?;
            self.upgrades.check_upgrade(&object, &upgrade).await?;
            return Ok((object.clone(), object));
        }

        if object.prototype_id == action.prototype_id {
            return Ok((object.clone(), object));
        }

        if object.object_type == ObjectType::Host && action.spec.host_action {
            let owner = self.host_action_owner(&object, action).await?;
            return Ok((object, owner));
        }

        Err(unavailable(
            action,
            format!("it is not declared for {}", object.object_ref()),
        ))
    }

    /// Member hosts of an action host group carry their own related sets
    async fn check_members_not_blocked(&self, target: TaskTarget, exclude_task: Option<i64>) -> Result<()> {
        let TaskTarget::ActionHostGroup { group_id } = target else {
            return Ok(());
        };
        if let Some(group) = self.db.get_host_group(group_id).await? {
            for host_id in group.hosts {
                self.concerns
                    .check_not_blocked(ObjectRef::host(host_id), exclude_task)
                    .await?;
            }
        }
        Ok(())
    }

    async fn host_action_owner(&self, host: &ObjectRecord, action: &ActionRecord) -> Result<ObjectRecord> {
        let Some(cluster_id) = host.cluster_id else {
            return Err(unavailable(action, format!("host {} is not in a cluster", host.name)));
        };
        let prototype = self.catalog.prototype(action.prototype_id).await?;
        let mapping = self.db.get_hostcomponents(cluster_id).await?;

        let owner = match prototype.prototype_type {
            PrototypeType::Cluster => Some(self.db.require_object(ObjectRef::cluster(cluster_id)).await?),
            PrototypeType::Service => self
                .db
                .list_children(ObjectType::Service, cluster_id)
                .await?
                .into_iter()
                .find(|s| {
                    s.prototype_id == prototype.id
                        && mapping.iter().any(|e| e.host_id == host.id && e.service_id == s.id)
                }),
            PrototypeType::Component => self
                .db
                .list_in_cluster(ObjectType::Component, cluster_id)
                .await?
                .into_iter()
                .find(|c| {
                    c.prototype_id == prototype.id
                        && mapping.iter().any(|e| e.host_id == host.id && e.component_id == c.id)
                }),
            _ => None,
        };
        owner.ok_or_else(|| {
            unavailable(
                action,
                format!("host {} does not run {} {}", host.name, prototype.prototype_type, prototype.name),
            )
        })
    }

    async fn check_maintenance(
        &self,
        action: &ActionRecord,
        object: &ObjectRecord,
        target: TaskTarget,
        topology: Option<&Topology>,
    ) -> Result<()> {
        if action.spec.allow_in_maintenance_mode {
            return Ok(());
        }

        let mut in_mm: Vec<String> = Vec::new();
        match target {
            TaskTarget::ActionHostGroup { group_id } => {
                if let Some(group) = self.db.get_host_group(group_id).await? {
                    for host_id in group.hosts {
                        let mm = match topology {
                            Some(topology) => topology.host_mm(host_id),
                            None => MaintenanceMode::Off,
                        };
                        if mm == MaintenanceMode::On {
                            in_mm.push(topology.map(|t| t.fqdn(host_id)).unwrap_or_default());
                        }
                    }
                }
            }
            TaskTarget::Object(_) => {
                let mm = match (object.object_type, topology) {
                    (ObjectType::Service | ObjectType::Component | ObjectType::Host, Some(topology)) => {
                        topology.effective_mm(object.object_ref())
                    }
                    (ObjectType::Host, None) => object.maintenance_mode,
                    _ => MaintenanceMode::Off,
                };
                if mm == MaintenanceMode::On {
                    in_mm.push(object.name.clone());
                }
            }
        }

        match in_mm.first() {
            Some(name) => Err(ConductorError::MaintenanceMode {
                object: name.clone(),
                action: action.display_name(),
            }
            .into()),
            None => Ok(()),
        }
    }

    async fn hc_delta(
        &self,
        action: &ActionRecord,
        object: &ObjectRecord,
        desired: &BTreeSet<(i64, i64)>,
    ) -> Result<HcDelta> {
        let Some(cluster_id) = cluster_of(object) else {
            return Err(ConductorError::WrongActionHc {
                reason: format!("{} is not part of a cluster", object.name),
            }
            .into());
        };
        let (topology, delta) = self.topology.preview_mapping(cluster_id, desired).await?;
        hc_acl::check_hc_acl(&topology, &action.spec.hc_acl, &delta)?;
        Ok(delta)
    }

    /// Per-run config built over the resolved schema; (config, attr)
    fn action_config(
        &self,
        schema: &ConfigDefinition,
        request: &LaunchRequest,
    ) -> Result<(Option<Value>, Value)> {
        if schema.is_empty() {
            let has_values = request
                .config
                .as_ref()
                .and_then(Value::as_object)
                .is_some_and(|m| !m.is_empty());
            if has_values {
                return Err(ConductorError::ConfigKey {
                    key: "config".to_string(),
                    reason: "action declares no config".to_string(),
                }
                .into());
            }
            return Ok((None, request.attr.clone().unwrap_or_else(|| json!({}))));
        }
        let (config, attr) =
            self.config
                .build_action_config(schema, request.config.as_ref(), request.attr.as_ref())?;
        Ok((Some(config), attr))
    }

    async fn read_template(&self, action: &ActionRecord, template: &str) -> Result<String> {
        let prototype = self.catalog.prototype(action.prototype_id).await?;
        let bundle = self.catalog.get_bundle(prototype.bundle_id).await?;
        jinja::read_template(&self.settings.dirs.bundle_dir(&bundle.hash), template).await
    }

    async fn template_context(
        &self,
        action: &ActionRecord,
        owner: &ObjectRecord,
        topology: Option<&Topology>,
        delta: Option<&HcDelta>,
        verbose: bool,
    ) -> Result<Value> {
        let prototype = self.catalog.prototype(action.prototype_id).await?;
        let (cluster, services, groups) = match topology {
            Some(topology) => {
                let (cluster, services) = self.inventory.cluster_vars(topology, SecretSink::Sealed).await?;
                (cluster, services, InventoryBuilder::template_groups(topology, delta))
            }
            None => (Value::Null, json!({}), json!({})),
        };

        let (service_name, component_name) = match (owner.object_type, topology) {
            (ObjectType::Service, Some(topology)) => (
                topology.services.get(&owner.id).map(|s| s.prototype.name.clone()),
                None,
            ),
            (ObjectType::Component, Some(topology)) => match topology.component(owner.id) {
                Some((service, component)) => (
                    Some(service.prototype.name.clone()),
                    Some(component.prototype.name.clone()),
                ),
                None => (None, None),
            },
            _ => (None, None),
        };

        Ok(json!({
            "cluster": cluster,
            "services": services,
            "groups": groups,
            "task": {"config": null, "verbose": verbose},
            "action": {
                "owner_group": jinja::owner_group(
                    prototype.prototype_type,
                    service_name.as_deref(),
                    component_name.as_deref(),
                ),
                "name": action.name,
            },
        }))
    }

    /// Object and its ancestors, by type
    async fn selector(&self, object: &ObjectRecord) -> Result<BTreeMap<String, SelectorEntry>> {
        let mut selector = BTreeMap::new();
        let mut add = |record: &ObjectRecord| {
            selector.insert(
                record.object_type.as_str().to_string(),
                SelectorEntry {
                    id: record.id,
                    name: record.name.clone(),
                },
            );
        };
        add(object);

        let mut ancestors = Vec::new();
        match object.object_type {
            ObjectType::Component => {
                if let Some(service_id) = object.parent_id {
                    ancestors.push(ObjectRef::service(service_id));
                }
            }
            ObjectType::Host => {
                if let Some(provider_id) = object.parent_id {
                    ancestors.push(ObjectRef::provider(provider_id));
                }
            }
            _ => {}
        }
        if object.object_type != ObjectType::Cluster {
            if let Some(cluster_id) = object.cluster_id {
                ancestors.push(ObjectRef::cluster(cluster_id));
            }
        }
        for ancestor in ancestors {
            if let Some(record) = self.db.get_object(ancestor).await? {
                add(&record);
            }
        }
        Ok(selector)
    }
}
