//! Resolution of plugin call targets against the calling job's context.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::database::{Database, ObjectRecord, ObjectRef, ObjectType, TaskRecord};
use crate::errors::ConductorError;

pub(crate) fn plugin_error(reason: impl Into<String>) -> anyhow::Error {
    ConductorError::Plugin {
        reason: reason.into(),
    }
    .into()
}

/// Object a callback operates on. Variants without names refer to the
/// object of that type in the task's context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Cluster,
    Service {
        #[serde(default)]
        service_name: Option<String>,
    },
    Component {
        #[serde(default)]
        service_name: Option<String>,
        #[serde(default)]
        component_name: Option<String>,
    },
    /// With `host_id` the host must belong to the context provider
    Host {
        #[serde(default)]
        host_id: Option<i64>,
    },
    Provider,
}

/// Id of the object of `kind` the task was launched within
pub fn context_id(task: &TaskRecord, kind: ObjectType) -> Result<i64> {
    task.selector
        .get(kind.as_str())
        .map(|entry| entry.id)
        .ok_or_else(|| {
            plugin_error(format!(
                "there is no {} in the context of task #{}",
                kind.as_str(),
                task.id
            ))
        })
}

pub async fn child_by_name(
    db: &Database,
    kind: ObjectType,
    parent_id: i64,
    name: &str,
) -> Result<ObjectRecord> {
    db.list_children(kind, parent_id)
        .await?
        .into_iter()
        .find(|child| child.name == name)
        .ok_or_else(|| {
            ConductorError::ObjectNotFound {
                object: format!("{} {}", kind.as_str(), name),
            }
            .into()
        })
}

pub async fn resolve(db: &Database, task: &TaskRecord, operation: &Operation) -> Result<ObjectRecord> {
    match operation {
        Operation::Cluster => {
            let id = context_id(task, ObjectType::Cluster)?;
            db.require_object(ObjectRef::cluster(id)).await
        }
        Operation::Provider => {
            let id = context_id(task, ObjectType::Provider)?;
            db.require_object(ObjectRef::provider(id)).await
        }
        Operation::Service { service_name: None } => {
            let id = context_id(task, ObjectType::Service)?;
            db.require_object(ObjectRef::service(id)).await
        }
        Operation::Service {
            service_name: Some(name),
        } => {
            let cluster_id = context_id(task, ObjectType::Cluster)?;
            child_by_name(db, ObjectType::Service, cluster_id, name).await
        }
        Operation::Component {
            service_name,
            component_name: None,
        } => {
            if service_name.is_some() {
                return Err(plugin_error("component_name is required with service_name"));
            }
            let id = context_id(task, ObjectType::Component)?;
            db.require_object(ObjectRef::component(id)).await
        }
        Operation::Component {
            service_name,
            component_name: Some(name),
        } => {
            let service = match service_name {
                Some(service_name) => {
                    let cluster_id = context_id(task, ObjectType::Cluster)?;
                    child_by_name(db, ObjectType::Service, cluster_id, service_name).await?
                }
                None => {
                    let id = context_id(task, ObjectType::Service)?;
                    db.require_object(ObjectRef::service(id)).await?
                }
            };
            child_by_name(db, ObjectType::Component, service.id, name).await
        }
        Operation::Host { host_id: None } => {
            let id = context_id(task, ObjectType::Host)?;
            db.require_object(ObjectRef::host(id)).await
        }
        Operation::Host { host_id: Some(id) } => {
            let provider_id = context_id(task, ObjectType::Provider)?;
            let host = db.require_object(ObjectRef::host(*id)).await?;
            if host.parent_id != Some(provider_id) {
                return Err(plugin_error(format!(
                    "host {} does not belong to provider #{}",
                    host.name, provider_id
                )));
            }
            Ok(host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_wire_format() {
        let op: Operation = serde_json::from_value(json!({"type": "cluster"})).unwrap();
        assert_eq!(op, Operation::Cluster);

        let op: Operation =
            serde_json::from_value(json!({"type": "component", "component_name": "server"})).unwrap();
        assert_eq!(
            op,
            Operation::Component {
                service_name: None,
                component_name: Some("server".to_string()),
            }
        );

        let op: Operation = serde_json::from_value(json!({"type": "host", "host_id": 7})).unwrap();
        assert_eq!(op, Operation::Host { host_id: Some(7) });

        assert!(serde_json::from_value::<Operation>(json!({"type": "bundle"})).is_err());
    }
}
