// File: conductor/src/effects/mod.rs
//! State mutations caused by job and task outcomes and by plugin callbacks.
//!
//! Every mutation publishes an `ObjectUpdated` event after it is written.
//! Task finalisation applies effects before the task lock is released.

use anyhow::Result;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::catalog::definition::StateEffect;
use crate::catalog::Catalog;
use crate::concerns::ConcernService;
use crate::config::MaintenanceActionNames;
use crate::database::{
    Database, HcEntry, JobRecord, MaintenanceMode, ObjectRef, ObjectType, TaskRecord, TaskStatus,
};
use crate::errors::ConductorError;
use crate::events::{DomainEvent, EventBus};
use crate::topology::TopologyService;

pub struct EffectApplier {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    topology: Arc<TopologyService>,
    concerns: Arc<ConcernService>,
    mm_actions: MaintenanceActionNames,
    events: EventBus,
}

impl EffectApplier {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        topology: Arc<TopologyService>,
        concerns: Arc<ConcernService>,
        mm_actions: MaintenanceActionNames,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            catalog,
            topology,
            concerns,
            mm_actions,
            events,
        }
    }

    pub async fn set_state(&self, object: ObjectRef, state: &str) -> Result<()> {
        self.db.require_object(object).await?;
        self.db.update_state(object, state).await?;
        self.events.object_updated(object, json!({"state": state}));
        Ok(())
    }

    pub async fn set_multi_state(&self, object: ObjectRef, value: &str) -> Result<()> {
        let record = self.db.require_object(object).await?;
        let mut multi_state = record.multi_state;
        if multi_state.insert(value.to_string()) {
            self.db.update_multi_state(object, &multi_state).await?;
        }
        self.events
            .object_updated(object, json!({"multi_state": multi_state}));
        Ok(())
    }

    /// Remove one multi_state value; a missing value fails unless `missing_ok`
    pub async fn unset_multi_state(&self, object: ObjectRef, value: &str, missing_ok: bool) -> Result<()> {
        let record = self.db.require_object(object).await?;
        let mut multi_state = record.multi_state;
        if !multi_state.remove(value) {
            if missing_ok {
                return Ok(());
            }
            return Err(ConductorError::Plugin {
                reason: format!("no multi_state '{}' on {}", value, record.name),
            }
            .into());
        }
        self.db.update_multi_state(object, &multi_state).await?;
        self.events
            .object_updated(object, json!({"multi_state": multi_state}));
        Ok(())
    }

    /// Apply a declared state effect to one object
    pub async fn apply(&self, object: ObjectRef, effect: &StateEffect) -> Result<()> {
        if effect.is_empty() {
            return Ok(());
        }
        let Some(record) = self.db.get_object(object).await? else {
            warn!("Skipping effects on deleted {}", object);
            return Ok(());
        };

        let mut changes = serde_json::Map::new();
        if let Some(state) = &effect.set_state {
            self.db.update_state(object, state).await?;
            changes.insert("state".into(), json!(state));
        }

        if !effect.set_multi_state.is_empty() || !effect.unset_multi_state.is_empty() {
            let mut multi_state = record.multi_state;
            multi_state.extend(effect.set_multi_state.iter().cloned());
            for value in &effect.unset_multi_state {
                multi_state.remove(value);
            }
            self.db.update_multi_state(object, &multi_state).await?;
            changes.insert("multi_state".into(), json!(multi_state));
        }

        info!("Applied effects on {}: {}", object, serde_json::Value::Object(changes.clone()));
        self.events.object_updated(object, serde_json::Value::Object(changes));
        Ok(())
    }

    /// Failure policy of a single subaction
    pub async fn apply_job_failure(&self, task: &TaskRecord, job: &JobRecord) -> Result<()> {
        let effect = StateEffect {
            set_state: job.spec.state_on_fail.clone(),
            set_multi_state: job.spec.multi_state_on_fail_set.clone(),
            unset_multi_state: job.spec.multi_state_on_fail_unset.clone(),
        };
        self.apply(task.object, &effect).await
    }

    /// Terminal-status handling: effects, mapping commit, lock release and
    /// issue refresh, in that order. The lock is released even when an
    /// effect fails; the effect error is returned afterwards.
    #[instrument(skip(self, task), fields(task_id = task.id))]
    pub async fn finalize_task(&self, task: &TaskRecord, status: TaskStatus) -> Result<()> {
        let applied = self.apply_terminal_effects(task, status).await;

        self.concerns.release_task_lock(task.id).await?;
        if self.db.get_object(task.object).await?.is_some() {
            self.concerns.refresh_object(task.object).await?;
        }
        applied
    }

    async fn apply_terminal_effects(&self, task: &TaskRecord, status: TaskStatus) -> Result<()> {
        let action = self.catalog.action(task.action_id).await?;

        match status {
            TaskStatus::Success => {
                if let Some(effect) = &action.spec.on_success {
                    self.apply(task.object, effect).await?;
                }
                if let Some(delta) = &task.hostcomponent {
                    self.commit_hc(task.object, &delta.desired()).await?;
                }
            }
            TaskStatus::Failed | TaskStatus::Aborted => {
                if let Some(effect) = &action.spec.on_fail {
                    self.apply(task.object, effect).await?;
                }
            }
            _ => {}
        }
        self.settle_maintenance_mode(task.object, &action.name, status).await
    }

    /// A maintenance-mode action left its object CHANGING: success lands on
    /// the requested value, anything else on the opposite one
    async fn settle_maintenance_mode(&self, object: ObjectRef, action_name: &str, status: TaskStatus) -> Result<()> {
        let names = &self.mm_actions;
        let requested = if action_name == names.turn_on || action_name == names.host_turn_on {
            MaintenanceMode::On
        } else if action_name == names.turn_off || action_name == names.host_turn_off {
            MaintenanceMode::Off
        } else {
            return Ok(());
        };
        let Some(record) = self.db.get_object(object).await? else {
            return Ok(());
        };
        if record.maintenance_mode != MaintenanceMode::Changing {
            return Ok(());
        }

        let value = match (status, requested) {
            (TaskStatus::Success, value) => value,
            (_, MaintenanceMode::On) => MaintenanceMode::Off,
            _ => MaintenanceMode::On,
        };
        self.db.update_maintenance_mode(object, value).await?;
        self.events.publish(DomainEvent::MaintenanceModeChanged { object, value });
        self.events
            .object_updated(object, json!({"maintenance_mode": value}));
        if let Some(cluster_id) = record.cluster_id {
            self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        }
        info!("Maintenance mode of {} settled to {}", object, value.as_str());
        Ok(())
    }

    async fn commit_hc(&self, object: ObjectRef, desired: &BTreeSet<HcEntry>) -> Result<()> {
        let Some(cluster_id) = self.cluster_of(object).await? else {
            warn!("Task object {} has no cluster, mapping not committed", object);
            return Ok(());
        };
        self.topology.commit_mapping(cluster_id, desired).await?;
        self.events.publish(DomainEvent::TopologyChanged { cluster_id });
        Ok(())
    }

    async fn cluster_of(&self, object: ObjectRef) -> Result<Option<i64>> {
        if object.object_type == ObjectType::Cluster {
            return Ok(Some(object.id));
        }
        Ok(self.db.get_object(object).await?.and_then(|o| o.cluster_id))
    }
}
