//! Scripts implemented in-process: `bundle_switch`, `bundle_revert`, `hc_apply`.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::catalog::Catalog;
use crate::database::{Database, JobRecord, ObjectType, TaskRecord};
use crate::errors::ConductorError;
use crate::events::{DomainEvent, EventBus};
use crate::services::UpgradeService;
use crate::topology::TopologyService;

pub const BUNDLE_SWITCH: &str = "bundle_switch";
pub const BUNDLE_REVERT: &str = "bundle_revert";
pub const HC_APPLY: &str = "hc_apply";

fn script_error(reason: String) -> anyhow::Error {
    ConductorError::Execution { reason }.into()
}

pub struct InternalScripts {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    topology: Arc<TopologyService>,
    upgrades: Arc<UpgradeService>,
    events: EventBus,
}

impl InternalScripts {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        topology: Arc<TopologyService>,
        upgrades: Arc<UpgradeService>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            catalog,
            topology,
            upgrades,
            events,
        }
    }

    /// Run one internal job; the returned text becomes its stdout log
    #[instrument(skip(self, task, job), fields(task_id = task.id, script = %job.spec.script))]
    pub async fn run(&self, task: &TaskRecord, job: &JobRecord) -> Result<String> {
        match job.spec.script.as_str() {
            BUNDLE_SWITCH => self.bundle_switch(task).await,
            BUNDLE_REVERT => {
                self.upgrades.bundle_revert(task.object).await?;
                Ok(format!("{} reverted to its previous bundle", task.object))
            }
            HC_APPLY => self.hc_apply(task).await,
            other => Err(script_error(format!("unknown internal script '{}'", other))),
        }
    }

    async fn bundle_switch(&self, task: &TaskRecord) -> Result<String> {
        let action = self.catalog.action(task.action_id).await?;
        let Some(upgrade_id) = action.upgrade_id else {
            return Err(script_error(format!(
                "action {} is not an upgrade action",
                action.name
            )));
        };
        let upgrade = self.catalog.get_upgrade(upgrade_id).await?;
        self.upgrades.bundle_switch(task.object, upgrade.bundle_id).await?;
        info!("Upgrade {} switched {}", upgrade.name, task.object);
        Ok(format!("{} switched to bundle #{}", task.object, upgrade.bundle_id))
    }

    async fn hc_apply(&self, task: &TaskRecord) -> Result<String> {
        let Some(delta) = &task.hostcomponent else {
            return Err(script_error("task carries no host-component map".to_string()));
        };
        let object = self.db.require_object(task.object).await?;
        let cluster_id = match object.object_type {
            ObjectType::Cluster => Some(object.id),
            _ => object.cluster_id,
        }
        .ok_or_else(|| script_error(format!("{} is not part of a cluster", object.name)))?;

        let desired = delta.desired();
        self.topology.commit_mapping(cluster_id, &desired).await?;
        self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        Ok(format!("{} host-component entries applied", desired.len()))
    }
}
