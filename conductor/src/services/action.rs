// File: conductor/src/services/action.rs
//! Operator entry points that start, upgrade and stop work.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::catalog::Catalog;
use crate::config::MaintenanceActionNames;
use crate::database::{
    Database, MaintenanceMode, ObjectRef, ObjectType, TaskRecord, TaskStatus, UpgradeRecord,
};
use crate::errors::{error_code, ConductorError};
use crate::planner::ActionPlanner;
use crate::scheduler::TaskScheduler;

use super::{AuditHook, ClusterService, UpgradeService};

pub use crate::planner::LaunchRequest;

/// How an upgrade request was carried out
#[derive(Debug, Clone)]
pub enum UpgradeOutcome {
    /// Scriptless upgrade, switched in place
    Applied,
    /// Upgrade declares an action; a task now runs it
    Launched(TaskRecord),
}

/// How a maintenance-mode toggle was carried out
#[derive(Debug, Clone)]
pub enum MaintenanceOutcome {
    Unchanged,
    Applied(MaintenanceMode),
    /// Object is CHANGING until the launched task settles it
    Launched(TaskRecord),
}

pub struct ActionService {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    planner: Arc<ActionPlanner>,
    scheduler: Arc<TaskScheduler>,
    upgrades: Arc<UpgradeService>,
    cluster: Arc<ClusterService>,
    audit: Arc<dyn AuditHook>,
    mm_actions: MaintenanceActionNames,
}

impl ActionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        planner: Arc<ActionPlanner>,
        scheduler: Arc<TaskScheduler>,
        upgrades: Arc<UpgradeService>,
        cluster: Arc<ClusterService>,
        audit: Arc<dyn AuditHook>,
        mm_actions: MaintenanceActionNames,
    ) -> Self {
        Self {
            db,
            catalog,
            planner,
            scheduler,
            upgrades,
            cluster,
            audit,
            mm_actions,
        }
    }

    /// Plan and persist a CREATED task; the scheduler picks it up
    #[instrument(skip(self, request), fields(action_id = request.action_id, user = %request.user))]
    pub async fn launch(&self, request: &LaunchRequest) -> Result<TaskRecord> {
        let action = self.catalog.action(request.action_id).await?;
        let operation = format!("launch {}", action.name);
        let result = self.planner.create_task(request).await;

        match &result {
            Ok(task) => {
                self.audit
                    .record(&request.user, &operation, task.object, "success")
                    .await
            }
            Err(e) => {
                if let Some(object) = target_object(request) {
                    self.audit
                        .record(&request.user, &operation, object, error_code(e))
                        .await;
                }
            }
        }
        result
    }

    /// Terminate or revoke a task
    pub async fn cancel(&self, task_id: i64, user: &str) -> Result<TaskStatus> {
        let task = self.db.get_task(task_id).await?;
        let result = self.scheduler.cancel_task(task_id).await;
        if let Some(task) = task {
            let outcome = match &result {
                Ok(status) => status.as_str(),
                Err(e) => error_code(e),
            };
            self.audit.record(user, "cancel task", task.object, outcome).await;
        }
        result
    }

    pub async fn list_upgrades(&self, object: ObjectRef) -> Result<Vec<UpgradeRecord>> {
        self.upgrades.list_available(object).await
    }

    /// Run an upgrade: launch its action when it has one, switch otherwise
    #[instrument(skip(self))]
    pub async fn upgrade(&self, object: ObjectRef, upgrade_id: i64, user: &str) -> Result<UpgradeOutcome> {
        let upgrade = self.catalog.get_upgrade(upgrade_id).await?;
        match upgrade.action_id {
            Some(action_id) => {
                let record = self.db.require_object(object).await?;
                self.upgrades.check_upgrade(&record, &upgrade).await?;
                let task = self.launch(&LaunchRequest::new(object, action_id).by(user)).await?;
                info!("Upgrade {} of {} started as task #{}", upgrade.name, object, task.id);
                Ok(UpgradeOutcome::Launched(task))
            }
            None => {
                let result = self.upgrades.apply_upgrade(object, upgrade_id).await;
                let outcome = match &result {
                    Ok(()) => "success",
                    Err(e) => error_code(e),
                };
                self.audit
                    .record(user, &format!("upgrade {}", upgrade.name), object, outcome)
                    .await;
                result.map(|_| UpgradeOutcome::Applied)
            }
        }
    }

    /// Operator maintenance-mode toggle for a host, service or component
    #[instrument(skip(self))]
    pub async fn set_maintenance_mode(&self, object: ObjectRef, on: bool, user: &str) -> Result<MaintenanceOutcome> {
        let record = self.db.require_object(object).await?;
        if !matches!(
            record.object_type,
            ObjectType::Host | ObjectType::Service | ObjectType::Component
        ) {
            return Err(ConductorError::MaintenanceMode {
                object: record.name,
                action: "maintenance mode toggle".to_string(),
            }
            .into());
        }

        let requested = if on {
            MaintenanceMode::On
        } else {
            MaintenanceMode::Off
        };
        match record.maintenance_mode {
            current if current == requested => return Ok(MaintenanceOutcome::Unchanged),
            MaintenanceMode::Changing => {
                return Err(ConductorError::TaskBlocked {
                    object: record.name,
                    reason: "maintenance mode is already changing".to_string(),
                }
                .into())
            }
            _ => {}
        }

        let action_name = self.mm_action_name(record.object_type, on);
        let Some(action) = self.catalog.find_action(record.prototype_id, action_name).await? else {
            self.cluster.apply_maintenance_mode(object, requested).await?;
            self.audit
                .record(user, "maintenance mode", object, requested.as_str())
                .await;
            return Ok(MaintenanceOutcome::Applied(requested));
        };

        let previous = record.maintenance_mode;
        self.cluster
            .apply_maintenance_mode(object, MaintenanceMode::Changing)
            .await?;
        match self.launch(&LaunchRequest::new(object, action.id).by(user)).await {
            Ok(task) => Ok(MaintenanceOutcome::Launched(task)),
            Err(e) => {
                warn!("Maintenance action {} on {} refused: {:#}", action.name, object, e);
                self.cluster.apply_maintenance_mode(object, previous).await?;
                Err(e)
            }
        }
    }

    fn mm_action_name(&self, object_type: ObjectType, on: bool) -> &str {
        let names = &self.mm_actions;
        match (object_type, on) {
            (ObjectType::Host, true) => &names.host_turn_on,
            (ObjectType::Host, false) => &names.host_turn_off,
            (_, true) => &names.turn_on,
            (_, false) => &names.turn_off,
        }
    }
}

fn target_object(request: &LaunchRequest) -> Option<ObjectRef> {
    match request.target {
        crate::database::TaskTarget::Object(object) => Some(object),
        crate::database::TaskTarget::ActionHostGroup { .. } => None,
    }
}
