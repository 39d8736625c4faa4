//! Plugin callback API: model mutations requested by a running job.
//!
//! A job authenticates with its id and the token written into its
//! `config.json`. Each call names its kind in the `call` field and is
//! dispatched to a typed handler. Calls are idempotent: repeating one leaves
//! the model unchanged and reports `changed: false`.

pub mod check;
pub mod target;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::concerns::ConcernService;
use crate::constants::plugin::{CHECK_LOG_NAME, DEFAULT_FLAG_NAME};
use crate::database::{
    Database, JobRecord, JobStatus, LogFormat, LogType, MaintenanceMode, NewLog, ObjectRecord,
    ObjectRef, ObjectType, TaskRecord,
};
use crate::effects::EffectApplier;
use crate::errors::ConductorError;
use crate::params::ConfigService;
use crate::services::ClusterService;

pub use check::{CheckItem, CheckRequest};
pub use target::Operation;

use target::{child_by_name, context_id, plugin_error, resolve};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HcAction {
    Add,
    Remove,
}

/// One `change_hc` step, by names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HcOperation {
    pub action: HcAction,
    pub service: String,
    pub component: String,
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagOperation {
    Up,
    Down,
}

/// `key` is a `/`-separated path into the config tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigParameter {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum PluginCall {
    SetState {
        target: Operation,
        state: String,
    },
    SetMultiState {
        target: Operation,
        value: String,
    },
    UnsetMultiState {
        target: Operation,
        value: String,
        #[serde(default)]
        missing_ok: bool,
    },
    SetConfig {
        target: Operation,
        #[serde(default)]
        config: Option<Value>,
        #[serde(default)]
        parameters: Vec<ConfigParameter>,
        #[serde(default)]
        attr: Option<Value>,
    },
    ChangeHc {
        operations: Vec<HcOperation>,
    },
    ChangeFlag {
        operation: FlagOperation,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        msg: String,
        #[serde(default)]
        objects: Vec<Operation>,
    },
    Check(CheckRequest),
    AddHost {
        #[serde(default)]
        provider_id: Option<i64>,
        fqdn: String,
        #[serde(default)]
        description: String,
    },
    DeleteHost {
        #[serde(default)]
        host_id: Option<i64>,
    },
    AddHostToCluster {
        #[serde(default)]
        host_id: Option<i64>,
        #[serde(default)]
        fqdn: Option<String>,
    },
    RemoveHostFromCluster {
        #[serde(default)]
        host_id: Option<i64>,
        #[serde(default)]
        fqdn: Option<String>,
    },
    DeleteService {
        #[serde(default)]
        service_id: Option<i64>,
        #[serde(default)]
        service_name: Option<String>,
    },
    ChangeMaintenanceMode {
        target: Operation,
        value: bool,
    },
}

impl PluginCall {
    pub fn name(&self) -> &'static str {
        match self {
            PluginCall::SetState { .. } => "set_state",
            PluginCall::SetMultiState { .. } => "set_multi_state",
            PluginCall::UnsetMultiState { .. } => "unset_multi_state",
            PluginCall::SetConfig { .. } => "set_config",
            PluginCall::ChangeHc { .. } => "change_hc",
            PluginCall::ChangeFlag { .. } => "change_flag",
            PluginCall::Check(_) => "check",
            PluginCall::AddHost { .. } => "add_host",
            PluginCall::DeleteHost { .. } => "delete_host",
            PluginCall::AddHostToCluster { .. } => "add_host_to_cluster",
            PluginCall::RemoveHostFromCluster { .. } => "remove_host_from_cluster",
            PluginCall::DeleteService { .. } => "delete_service",
            PluginCall::ChangeMaintenanceMode { .. } => "change_maintenance_mode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl PluginResult {
    fn changed(changed: bool, value: Value) -> Self {
        Self { changed, value }
    }
}

/// The job and task a call is made from
#[derive(Debug, Clone)]
pub struct CallContext {
    pub job: JobRecord,
    pub task: TaskRecord,
}

pub struct PluginApi {
    db: Arc<Database>,
    config: Arc<ConfigService>,
    concerns: Arc<ConcernService>,
    effects: Arc<EffectApplier>,
    cluster: Arc<ClusterService>,
}

impl PluginApi {
    pub fn new(
        db: Arc<Database>,
        config: Arc<ConfigService>,
        concerns: Arc<ConcernService>,
        effects: Arc<EffectApplier>,
        cluster: Arc<ClusterService>,
    ) -> Self {
        Self {
            db,
            config,
            concerns,
            effects,
            cluster,
        }
    }

    /// Resolve the calling job; only a RUNNING job holding its token may call
    pub async fn authenticate(&self, job_id: i64, token: &str) -> Result<CallContext> {
        let denied = || -> anyhow::Error {
            ConductorError::Authorization {
                user: format!("job #{}", job_id),
                action: "plugin callback".to_string(),
            }
            .into()
        };
        let job = self.db.get_job(job_id).await?.ok_or_else(denied)?;
        if job.token.is_empty() || job.token != token {
            return Err(denied());
        }
        if job.status != JobStatus::Running {
            return Err(plugin_error(format!("job #{} is {}, not running", job.id, job.status)));
        }
        let task = self.db.get_task(job.task_id).await?.ok_or_else(|| {
            anyhow::Error::from(ConductorError::ObjectNotFound {
                object: format!("task #{}", job.task_id),
            })
        })?;
        Ok(CallContext { job, task })
    }

    /// Authenticate and dispatch one call
    #[instrument(skip(self, token, call), fields(call = call.name()))]
    pub async fn handle(&self, job_id: i64, token: &str, call: PluginCall) -> Result<PluginResult> {
        let ctx = self.authenticate(job_id, token).await?;
        let name = call.name();
        match self.dispatch(&ctx, call).await {
            Ok(result) => {
                info!("Job #{} called {} (changed: {})", job_id, name, result.changed);
                Ok(result)
            }
            Err(e) => {
                warn!("Job #{} call {} failed: {:#}", job_id, name, e);
                Err(e)
            }
        }
    }

    pub async fn dispatch(&self, ctx: &CallContext, call: PluginCall) -> Result<PluginResult> {
        match call {
            PluginCall::SetState { target, state } => self.set_state(ctx, &target, &state).await,
            PluginCall::SetMultiState { target, value } => {
                self.set_multi_state(ctx, &target, &value).await
            }
            PluginCall::UnsetMultiState {
                target,
                value,
                missing_ok,
            } => self.unset_multi_state(ctx, &target, &value, missing_ok).await,
            PluginCall::SetConfig {
                target,
                config,
                parameters,
                attr,
            } => {
                let patch = config_patch(config, &parameters)?;
                self.set_config(ctx, &target, &patch, attr.as_ref()).await
            }
            PluginCall::ChangeHc { operations } => self.change_hc(ctx, &operations).await,
            PluginCall::ChangeFlag {
                operation,
                name,
                msg,
                objects,
            } => self.change_flag(ctx, operation, name.as_deref(), &msg, &objects).await,
            PluginCall::Check(request) => self.check(ctx, &request).await,
            PluginCall::AddHost {
                provider_id,
                fqdn,
                description,
            } => self.add_host(ctx, provider_id, &fqdn, &description).await,
            PluginCall::DeleteHost { host_id } => self.delete_host(ctx, host_id).await,
            PluginCall::AddHostToCluster { host_id, fqdn } => {
                self.add_host_to_cluster(ctx, host_id, fqdn.as_deref()).await
            }
            PluginCall::RemoveHostFromCluster { host_id, fqdn } => {
                self.remove_host_from_cluster(ctx, host_id, fqdn.as_deref()).await
            }
            PluginCall::DeleteService {
                service_id,
                service_name,
            } => self.delete_service(ctx, service_id, service_name.as_deref()).await,
            PluginCall::ChangeMaintenanceMode { target, value } => {
                self.change_maintenance_mode(ctx, &target, value).await
            }
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    async fn set_state(&self, ctx: &CallContext, target: &Operation, state: &str) -> Result<PluginResult> {
        let object = resolve(&self.db, &ctx.task, target).await?;
        let changed = object.state != state;
        if changed {
            self.effects.set_state(object.object_ref(), state).await?;
        }
        Ok(PluginResult::changed(changed, json!(state)))
    }

    async fn set_multi_state(&self, ctx: &CallContext, target: &Operation, value: &str) -> Result<PluginResult> {
        let object = resolve(&self.db, &ctx.task, target).await?;
        let changed = !object.multi_state.contains(value);
        if changed {
            self.effects.set_multi_state(object.object_ref(), value).await?;
        }
        Ok(PluginResult::changed(changed, json!(value)))
    }

    async fn unset_multi_state(
        &self,
        ctx: &CallContext,
        target: &Operation,
        value: &str,
        missing_ok: bool,
    ) -> Result<PluginResult> {
        let object = resolve(&self.db, &ctx.task, target).await?;
        let changed = object.multi_state.contains(value);
        self.effects
            .unset_multi_state(object.object_ref(), value, missing_ok)
            .await?;
        Ok(PluginResult::changed(changed, json!(value)))
    }

    // ------------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------------

    async fn set_config(
        &self,
        ctx: &CallContext,
        target: &Operation,
        patch: &Value,
        attr: Option<&Value>,
    ) -> Result<PluginResult> {
        let object = resolve(&self.db, &ctx.task, target).await?;
        let owner = object.object_ref();
        let description = format!("set by job #{}", ctx.job.id);
        let log = self.config.put_config(owner, patch, attr, &description).await?;
        self.concerns.refresh_object(owner).await?;
        Ok(PluginResult::changed(true, json!({"config_id": log.id})))
    }

    // ------------------------------------------------------------------------
    // Host-component map
    // ------------------------------------------------------------------------

    /// Applied to the persisted mapping only; the task's own delta is kept
    async fn change_hc(&self, ctx: &CallContext, operations: &[HcOperation]) -> Result<PluginResult> {
        let cluster_id = context_id(&ctx.task, ObjectType::Cluster)?;
        let current: BTreeSet<(i64, i64)> = self
            .db
            .get_hostcomponents(cluster_id)
            .await?
            .into_iter()
            .map(|e| (e.host_id, e.component_id))
            .collect();

        let mut desired = current.clone();
        for op in operations {
            let service = child_by_name(&self.db, ObjectType::Service, cluster_id, &op.service).await?;
            let component = child_by_name(&self.db, ObjectType::Component, service.id, &op.component).await?;
            let host = self.host_by_fqdn(&op.host).await?;
            let pair = (host.id, component.id);
            match op.action {
                HcAction::Add => desired.insert(pair),
                HcAction::Remove => desired.remove(&pair),
            };
        }

        if desired == current {
            return Ok(PluginResult::changed(false, Value::Null));
        }
        let delta = self
            .cluster
            .set_mapping(cluster_id, &desired, Some(ctx.task.id))
            .await?;
        Ok(PluginResult::changed(
            true,
            json!({"added": delta.add.len(), "removed": delta.remove.len()}),
        ))
    }

    // ------------------------------------------------------------------------
    // Flags and checks
    // ------------------------------------------------------------------------

    async fn change_flag(
        &self,
        ctx: &CallContext,
        operation: FlagOperation,
        name: Option<&str>,
        msg: &str,
        objects: &[Operation],
    ) -> Result<PluginResult> {
        let mut owners: Vec<ObjectRef> = Vec::new();
        for target in objects {
            owners.push(resolve(&self.db, &ctx.task, target).await?.object_ref());
        }
        if owners.is_empty() {
            owners.push(ctx.task.object);
        }

        for owner in &owners {
            match operation {
                FlagOperation::Up => {
                    self.concerns
                        .raise_flag(*owner, name.unwrap_or(DEFAULT_FLAG_NAME), msg, false)
                        .await?
                }
                FlagOperation::Down => self.concerns.lower_flag(*owner, name).await?,
            }
        }
        Ok(PluginResult::changed(true, json!({"objects": owners.len()})))
    }

    async fn check(&self, ctx: &CallContext, request: &CheckRequest) -> Result<PluginResult> {
        let job_id = ctx.job.id;
        let existing = self.db.find_log(job_id, CHECK_LOG_NAME, LogType::Check).await?;
        let mut items: Vec<CheckItem> = match existing.as_ref().and_then(|log| log.body.as_deref()) {
            Some(body) if !body.is_empty() => serde_json::from_str(body)?,
            _ => Vec::new(),
        };

        let entry = check::append(&mut items, request)?;
        let body = serde_json::to_string(&items)?;
        match existing {
            Some(log) => self.db.update_log_body(log.id, &body).await?,
            None => {
                self.db
                    .insert_log(
                        job_id,
                        &NewLog {
                            name: CHECK_LOG_NAME.to_string(),
                            log_type: LogType::Check,
                            format: LogFormat::Json,
                            body: Some(body),
                            file: None,
                        },
                    )
                    .await?;
            }
        }
        Ok(PluginResult::changed(true, serde_json::to_value(entry)?))
    }

    // ------------------------------------------------------------------------
    // Hosts and services
    // ------------------------------------------------------------------------

    async fn add_host(
        &self,
        ctx: &CallContext,
        provider_id: Option<i64>,
        fqdn: &str,
        description: &str,
    ) -> Result<PluginResult> {
        let provider_id = match provider_id {
            Some(id) => id,
            None => context_id(&ctx.task, ObjectType::Provider)?,
        };
        if let Some(host) = self.db.find_object_by_name(ObjectType::Host, fqdn).await? {
            if host.parent_id == Some(provider_id) {
                return Ok(PluginResult::changed(false, json!({"host_id": host.id})));
            }
        }
        let host = self.cluster.create_host(provider_id, fqdn, description).await?;
        Ok(PluginResult::changed(true, json!({"host_id": host.id})))
    }

    async fn delete_host(&self, ctx: &CallContext, host_id: Option<i64>) -> Result<PluginResult> {
        let host_id = match host_id {
            Some(id) => id,
            None => context_id(&ctx.task, ObjectType::Host)?,
        };
        if self.db.get_object(ObjectRef::host(host_id)).await?.is_none() {
            return Ok(PluginResult::changed(false, Value::Null));
        }
        self.cluster.delete_host(host_id, Some(ctx.task.id)).await?;
        Ok(PluginResult::changed(true, json!({"host_id": host_id})))
    }

    async fn add_host_to_cluster(
        &self,
        ctx: &CallContext,
        host_id: Option<i64>,
        fqdn: Option<&str>,
    ) -> Result<PluginResult> {
        let cluster_id = context_id(&ctx.task, ObjectType::Cluster)?;
        let host = match (host_id, fqdn) {
            (Some(id), _) => self.db.require_object(ObjectRef::host(id)).await?,
            (None, Some(fqdn)) => self.host_by_fqdn(fqdn).await?,
            (None, None) => return Err(plugin_error("host_id or fqdn is required")),
        };
        if host.cluster_id == Some(cluster_id) {
            return Ok(PluginResult::changed(false, json!({"host_id": host.id})));
        }
        self.cluster
            .add_host_to_cluster(cluster_id, host.id, Some(ctx.task.id))
            .await?;
        Ok(PluginResult::changed(true, json!({"host_id": host.id})))
    }

    async fn remove_host_from_cluster(
        &self,
        ctx: &CallContext,
        host_id: Option<i64>,
        fqdn: Option<&str>,
    ) -> Result<PluginResult> {
        let host = match (host_id, fqdn) {
            (Some(id), _) => self.db.require_object(ObjectRef::host(id)).await?,
            (None, Some(fqdn)) => self.host_by_fqdn(fqdn).await?,
            (None, None) => {
                let id = context_id(&ctx.task, ObjectType::Host)?;
                self.db.require_object(ObjectRef::host(id)).await?
            }
        };
        if host.cluster_id.is_none() {
            return Ok(PluginResult::changed(false, json!({"host_id": host.id})));
        }
        self.cluster
            .remove_host_from_cluster(host.id, Some(ctx.task.id))
            .await?;
        Ok(PluginResult::changed(true, json!({"host_id": host.id})))
    }

    async fn delete_service(
        &self,
        ctx: &CallContext,
        service_id: Option<i64>,
        service_name: Option<&str>,
    ) -> Result<PluginResult> {
        let service_id = match (service_id, service_name) {
            (Some(id), _) => id,
            (None, Some(name)) => {
                let cluster_id = context_id(&ctx.task, ObjectType::Cluster)?;
                match child_by_name(&self.db, ObjectType::Service, cluster_id, name).await {
                    Ok(service) => service.id,
                    Err(_) => return Ok(PluginResult::changed(false, Value::Null)),
                }
            }
            (None, None) => context_id(&ctx.task, ObjectType::Service)?,
        };
        if self.db.get_object(ObjectRef::service(service_id)).await?.is_none() {
            return Ok(PluginResult::changed(false, Value::Null));
        }
        self.cluster.delete_service(service_id, Some(ctx.task.id)).await?;
        Ok(PluginResult::changed(true, json!({"service_id": service_id})))
    }

    // ------------------------------------------------------------------------
    // Maintenance mode
    // ------------------------------------------------------------------------

    async fn change_maintenance_mode(
        &self,
        ctx: &CallContext,
        target: &Operation,
        value: bool,
    ) -> Result<PluginResult> {
        let object = resolve(&self.db, &ctx.task, target).await?;
        if !matches!(
            object.object_type,
            ObjectType::Host | ObjectType::Service | ObjectType::Component
        ) {
            return Err(plugin_error(format!(
                "{} has no maintenance mode",
                object.object_type.as_str()
            )));
        }
        let value = if value {
            MaintenanceMode::On
        } else {
            MaintenanceMode::Off
        };
        if object.maintenance_mode == value {
            return Ok(PluginResult::changed(false, json!(value)));
        }
        if object.maintenance_mode != MaintenanceMode::Changing {
            return Err(plugin_error(format!(
                "maintenance mode of {} is not changing",
                object.name
            )));
        }
        self.cluster
            .apply_maintenance_mode(object.object_ref(), value)
            .await?;
        Ok(PluginResult::changed(true, json!(value)))
    }

    async fn host_by_fqdn(&self, fqdn: &str) -> Result<ObjectRecord> {
        self.db
            .find_object_by_name(ObjectType::Host, fqdn)
            .await?
            .ok_or_else(|| {
                ConductorError::ObjectNotFound {
                    object: format!("host {}", fqdn),
                }
                .into()
            })
    }
}

/// Merge a `set_config` dict and its `parameters` list into one patch
pub fn config_patch(config: Option<Value>, parameters: &[ConfigParameter]) -> Result<Value> {
    let mut patch = match config {
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(plugin_error(format!(
                "config must be an object, got {}",
                other
            )))
        }
        None => Map::new(),
    };

    for parameter in parameters {
        let path: Vec<&str> = parameter.key.split('/').filter(|p| !p.is_empty()).collect();
        let Some((leaf, groups)) = path.split_last() else {
            return Err(plugin_error("config parameter key is empty"));
        };
        let mut node = &mut patch;
        for group in groups {
            let entry = node
                .entry(group.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            node = match entry {
                Value::Object(map) => map,
                _ => {
                    return Err(plugin_error(format!(
                        "config key {} is not a group",
                        group
                    )))
                }
            };
        }
        node.insert(leaf.to_string(), parameter.value.clone());
    }

    if patch.is_empty() {
        return Err(plugin_error("set_config needs config or parameters"));
    }
    Ok(Value::Object(patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_patch_from_parameters() {
        let patch = config_patch(
            Some(json!({"port": 80})),
            &[
                ConfigParameter {
                    key: "tls/enabled".to_string(),
                    value: json!(true),
                },
                ConfigParameter {
                    key: "tls/cert".to_string(),
                    value: json!("/etc/cert.pem"),
                },
            ],
        )
        .unwrap();
        assert_eq!(
            patch,
            json!({"port": 80, "tls": {"enabled": true, "cert": "/etc/cert.pem"}})
        );
    }

    #[test]
    fn test_config_patch_rejects_bad_input() {
        assert!(config_patch(None, &[]).is_err());
        assert!(config_patch(Some(json!([1, 2])), &[]).is_err());
        let scalar_group = config_patch(
            Some(json!({"port": 80})),
            &[ConfigParameter {
                key: "port/inner".to_string(),
                value: json!(1),
            }],
        );
        assert!(scalar_group.is_err());
    }

    #[test]
    fn test_call_wire_format() {
        let call: PluginCall = serde_json::from_value(json!({
            "call": "set_state",
            "target": {"type": "service"},
            "state": "installed"
        }))
        .unwrap();
        assert_eq!(call.name(), "set_state");

        let call: PluginCall = serde_json::from_value(json!({
            "call": "change_hc",
            "operations": [
                {"action": "add", "service": "zookeeper", "component": "server", "host": "h1"}
            ]
        }))
        .unwrap();
        match call {
            PluginCall::ChangeHc { operations } => {
                assert_eq!(operations[0].action, HcAction::Add);
                assert_eq!(operations[0].host, "h1");
            }
            other => panic!("unexpected call {:?}", other),
        }

        let call: PluginCall = serde_json::from_value(json!({
            "call": "check",
            "title": "disk",
            "result": true,
            "success_msg": "ok"
        }))
        .unwrap();
        assert_eq!(call.name(), "check");

        let call: PluginCall =
            serde_json::from_value(json!({"call": "change_flag", "operation": "down"})).unwrap();
        assert_eq!(
            call,
            PluginCall::ChangeFlag {
                operation: FlagOperation::Down,
                name: None,
                msg: String::new(),
                objects: Vec::new(),
            }
        );
    }
}
