//! Concerns: issues, locks and flags attached to model objects.
//!
//! A concern is owned by exactly one object and is visible on that object
//! and on everything related to it. Visibility is computed on demand from
//! the current topology; nothing is stored per viewer.

pub mod issues;
pub mod reason;
pub mod related;

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::advisory::ClusterLocks;
use crate::catalog::Catalog;
use crate::constants::concerns::LOCK_NAME;
use crate::database::{
    ConcernRecord, ConcernType, Database, NewConcern, ObjectRecord, ObjectRef, ObjectType,
    TaskRecord,
};
use crate::errors::ConductorError;
use crate::events::{DomainEvent, EventBus};
use crate::params::ConfigService;
use crate::topology::{Topology, TopologyService};

use related::related_in_topology;

/// Concern ids visible per object
type Visibility = BTreeMap<ObjectRef, BTreeSet<i64>>;

pub struct ConcernService {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    config: Arc<ConfigService>,
    topology: Arc<TopologyService>,
    events: EventBus,
    locks: ClusterLocks,
}

impl ConcernService {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        config: Arc<ConfigService>,
        topology: Arc<TopologyService>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            catalog,
            config,
            topology,
            events,
            locks: ClusterLocks::new(),
        }
    }

    fn cluster_of(object: &ObjectRecord) -> Option<i64> {
        match object.object_type {
            ObjectType::Cluster => Some(object.id),
            _ => object.cluster_id,
        }
    }

    /// Objects whose concerns reach `object` and which see its concerns
    pub async fn related_objects(&self, object: ObjectRef) -> Result<BTreeSet<ObjectRef>> {
        let record = self.db.require_object(object).await?;
        match Self::cluster_of(&record) {
            Some(cluster_id) => {
                let topology = self.topology.retrieve_topology(cluster_id).await?;
                Ok(related_in_topology(object, &topology))
            }
            None => Ok(BTreeSet::new()),
        }
    }

    /// Every concern visible on `object`, ordered by id
    pub async fn concerns_on(&self, object: ObjectRef) -> Result<Vec<ConcernRecord>> {
        let record = self.db.require_object(object).await?;
        let mut owners = BTreeSet::from([object]);

        if let Some(cluster_id) = Self::cluster_of(&record) {
            let topology = self.topology.retrieve_topology(cluster_id).await?;
            owners.extend(related_in_topology(object, &topology));
        }
        if object.object_type == ObjectType::Host {
            if let Some(provider_id) = record.parent_id {
                owners.insert(ObjectRef::provider(provider_id));
            }
        }

        let mut visible = Vec::new();
        for owner in owners {
            visible.extend(self.db.list_concerns_owned_by(owner).await?);
        }
        visible.sort_by_key(|c| c.id);
        Ok(visible)
    }

    /// First blocking concern on `object`, ignoring locks held by `exclude_task`
    pub async fn blocking_concern_on(
        &self,
        object: ObjectRef,
        exclude_task: Option<i64>,
    ) -> Result<Option<ConcernRecord>> {
        Ok(self
            .concerns_on(object)
            .await?
            .into_iter()
            .filter(|c| c.blocking)
            .find(|c| !(c.concern_type == ConcernType::Lock && c.task_id.is_some() && c.task_id == exclude_task)))
    }

    pub async fn check_not_blocked(&self, object: ObjectRef, exclude_task: Option<i64>) -> Result<()> {
        if let Some(concern) = self.blocking_concern_on(object, exclude_task).await? {
            let record = self.db.require_object(object).await?;
            return Err(ConductorError::TaskBlocked {
                object: record.name,
                reason: concern.reason.render(),
            }
            .into());
        }
        Ok(())
    }

    /// Deletion is refused while a lock or a blocking flag is visible.
    /// Locks of `within_task` do not count.
    pub async fn ensure_deletable(&self, object: ObjectRef, within_task: Option<i64>) -> Result<()> {
        let guard = self.concerns_on(object).await?.into_iter().find(|c| match c.concern_type {
            ConcernType::Lock => within_task.is_none() || c.task_id != within_task,
            ConcernType::Flag => c.blocking,
            ConcernType::Issue => false,
        });
        if let Some(concern) = guard {
            let record = self.db.require_object(object).await?;
            return Err(ConductorError::IssueIntegrity {
                object: record.name,
                reason: concern.reason.render(),
            }
            .into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Issues
    // ------------------------------------------------------------------------

    /// Re-detect issues of one object and of its cluster neighbourhood
    pub async fn refresh_object(&self, object: ObjectRef) -> Result<()> {
        let record = self.db.require_object(object).await?;
        match Self::cluster_of(&record) {
            Some(cluster_id) => self.refresh_cluster(cluster_id).await,
            None => {
                let before = self.visible_ids(object).await?;
                self.sync_issues(&record, None).await?;
                let after = self.visible_ids(object).await?;
                self.publish_diff(&BTreeMap::from([(object, before)]), &BTreeMap::from([(object, after)]));
                Ok(())
            }
        }
    }

    /// Re-detect issues of every object in a cluster.
    ///
    /// Runs under the cluster advisory lock and publishes ConcernChanged for
    /// each object whose visible set changed.
    #[instrument(skip(self))]
    pub async fn refresh_cluster(&self, cluster_id: i64) -> Result<()> {
        let _guard = self.locks.lock(cluster_id).await;

        let topology = self.topology.retrieve_topology(cluster_id).await?;
        let before = self.cluster_visibility(&topology).await?;

        let mut records = vec![topology.cluster.clone()];
        for service in topology.services.values() {
            records.push(service.service.clone());
            records.extend(service.components.values().map(|c| c.component.clone()));
        }
        records.extend(topology.hosts.values().map(|h| h.host.clone()));

        for record in &records {
            self.sync_issues(record, Some(&topology)).await?;
        }

        let after = self.cluster_visibility(&topology).await?;
        self.publish_diff(&before, &after);
        debug!("Issues of cluster #{} refreshed", cluster_id);
        Ok(())
    }

    /// Create missing and remove stale issue rows of `object`
    async fn sync_issues(&self, object: &ObjectRecord, topology: Option<&Topology>) -> Result<()> {
        let owner = object.object_ref();
        let present = self.detect_issues(object, topology).await?;

        for cause in issues::causes_for(object.object_type) {
            if present.contains(cause) {
                let concern = NewConcern {
                    concern_type: ConcernType::Issue,
                    cause: Some(*cause),
                    name: cause.as_str().to_string(),
                    owner,
                    blocking: true,
                    reason: reason::issue(*cause, object),
                    task_id: None,
                };
                if let Some(id) = self.db.insert_concern(&concern).await? {
                    info!("Issue {} raised on {} (#{})", cause.as_str(), owner, id);
                }
            } else if self.db.delete_issue(owner, *cause).await? {
                info!("Issue {} cleared on {}", cause.as_str(), owner);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------------

    /// Lock the task object; a task that already holds its lock keeps it
    #[instrument(skip(self, task), fields(task_id = task.id))]
    pub async fn acquire_task_lock(&self, task: &TaskRecord, action_name: &str) -> Result<()> {
        if !self.db.list_task_locks(task.id).await?.is_empty() {
            return Ok(());
        }
        let target = self.db.require_object(task.object).await?;
        let concern = NewConcern {
            concern_type: ConcernType::Lock,
            cause: None,
            name: LOCK_NAME.to_string(),
            owner: task.object,
            blocking: true,
            reason: reason::lock(&target, task.id, action_name),
            task_id: Some(task.id),
        };
        if let Some(id) = self.db.insert_concern(&concern).await? {
            info!("Task #{} locked {}", task.id, task.object);
            self.publish_reach(task.object, vec![id], Vec::new()).await?;
        }
        Ok(())
    }

    pub async fn release_task_lock(&self, task_id: i64) -> Result<()> {
        for lock in self.db.list_task_locks(task_id).await? {
            self.db.delete_concern(lock.id).await?;
            info!("Task #{} released lock on {}", task_id, lock.owner);
            if self.db.get_object(lock.owner).await?.is_some() {
                self.publish_reach(lock.owner, Vec::new(), vec![lock.id]).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------------

    /// Raise a named flag; raising an existing flag is a no-op
    pub async fn raise_flag(&self, owner: ObjectRef, name: &str, message: &str, blocking: bool) -> Result<()> {
        let record = self.db.require_object(owner).await?;
        let concern = NewConcern {
            concern_type: ConcernType::Flag,
            cause: None,
            name: name.to_string(),
            owner,
            blocking,
            reason: reason::flag(&record, message),
            task_id: None,
        };
        if let Some(id) = self.db.insert_concern(&concern).await? {
            info!("Flag '{}' raised on {}", name, owner);
            self.publish_reach(owner, vec![id], Vec::new()).await?;
        }
        Ok(())
    }

    /// Lower the named flag, or every flag of `owner` when `name` is None
    pub async fn lower_flag(&self, owner: ObjectRef, name: Option<&str>) -> Result<()> {
        let flags: Vec<ConcernRecord> = self
            .db
            .list_concerns_owned_by(owner)
            .await?
            .into_iter()
            .filter(|c| c.concern_type == ConcernType::Flag)
            .filter(|c| name.is_none_or(|n| c.name == n))
            .collect();

        let mut removed = Vec::new();
        for flag in flags {
            if self.db.delete_concern(flag.id).await? {
                info!("Flag '{}' lowered on {}", flag.name, owner);
                removed.push(flag.id);
            }
        }
        if !removed.is_empty() {
            self.publish_reach(owner, Vec::new(), removed).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Visibility events
    // ------------------------------------------------------------------------

    async fn visible_ids(&self, object: ObjectRef) -> Result<BTreeSet<i64>> {
        Ok(self.concerns_on(object).await?.into_iter().map(|c| c.id).collect())
    }

    /// Visible concern ids of every object in the cluster, from one topology
    async fn cluster_visibility(&self, topology: &Topology) -> Result<Visibility> {
        let objects = topology.objects();
        let mut visibility: Visibility = objects.iter().map(|o| (*o, BTreeSet::new())).collect();

        for owner in &objects {
            let owned = self.db.list_concerns_owned_by(*owner).await?;
            if owned.is_empty() {
                continue;
            }
            let mut reach = related_in_topology(*owner, topology);
            reach.insert(*owner);
            for object in reach {
                visibility
                    .entry(object)
                    .or_default()
                    .extend(owned.iter().map(|c| c.id));
            }
        }

        for host in topology.hosts.values() {
            if let Some(provider_id) = host.host.parent_id {
                let owned = self.db.list_concerns_owned_by(ObjectRef::provider(provider_id)).await?;
                visibility
                    .entry(host.host.object_ref())
                    .or_default()
                    .extend(owned.iter().map(|c| c.id));
            }
        }
        Ok(visibility)
    }

    fn publish_diff(&self, before: &Visibility, after: &Visibility) {
        let empty = BTreeSet::new();
        let objects: BTreeSet<&ObjectRef> = before.keys().chain(after.keys()).collect();
        for object in objects {
            let old = before.get(object).unwrap_or(&empty);
            let new = after.get(object).unwrap_or(&empty);
            let added: Vec<i64> = new.difference(old).copied().collect();
            let removed: Vec<i64> = old.difference(new).copied().collect();
            if !added.is_empty() || !removed.is_empty() {
                self.events.publish(DomainEvent::ConcernChanged {
                    object: *object,
                    added,
                    removed,
                });
            }
        }
    }

    /// Publish a change of concerns owned by `owner` to everything they reach
    async fn publish_reach(&self, owner: ObjectRef, added: Vec<i64>, removed: Vec<i64>) -> Result<()> {
        let mut reach = self.related_objects(owner).await?;
        reach.insert(owner);
        if owner.object_type == ObjectType::Provider {
            reach.extend(
                self.db
                    .list_children(ObjectType::Host, owner.id)
                    .await?
                    .iter()
                    .map(|h| h.object_ref()),
            );
        }
        for object in reach {
            self.events.publish(DomainEvent::ConcernChanged {
                object,
                added: added.clone(),
                removed: removed.clone(),
            });
        }
        Ok(())
    }
}
