// File: conductor/src/services/mod.rs
//! Application services: the write paths of the control plane.

pub mod action;
pub mod cluster;
pub mod upgrade;

pub use action::{ActionService, LaunchRequest};
pub use cluster::ClusterService;
pub use upgrade::UpgradeService;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::database::ObjectRef;

/// RBAC predicate consulted before an action is planned
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_run(&self, user: &str, object: ObjectRef, action: &str) -> Result<bool>;
}

/// Grants everything
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_run(&self, _user: &str, _object: ObjectRef, _action: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Receives one record per operator-visible operation
#[async_trait]
pub trait AuditHook: Send + Sync {
    async fn record(&self, user: &str, operation: &str, object: ObjectRef, outcome: &str);
}

/// Writes audit records as structured log lines
pub struct TracingAudit;

#[async_trait]
impl AuditHook for TracingAudit {
    async fn record(&self, user: &str, operation: &str, object: ObjectRef, outcome: &str) {
        info!(
            target: "audit",
            user = user,
            operation = operation,
            object_type = object.object_type.as_str(),
            object_id = object.id,
            outcome = outcome,
            "audit"
        );
    }
}
