//! Concern reason templates and placeholder descriptors.

use std::collections::BTreeMap;

use crate::database::{
    ConcernCause, ConcernReason, ObjectRecord, ObjectType, PlaceholderObject,
};

/// Descriptor of a model object with the id chain the UI needs to link it
pub fn placeholder(object: &ObjectRecord) -> PlaceholderObject {
    let mut params = BTreeMap::new();
    match object.object_type {
        ObjectType::Cluster => {
            params.insert("cluster_id".to_string(), object.id);
        }
        ObjectType::Service => {
            params.insert("service_id".to_string(), object.id);
            if let Some(cluster_id) = object.cluster_id {
                params.insert("cluster_id".to_string(), cluster_id);
            }
        }
        ObjectType::Component => {
            params.insert("component_id".to_string(), object.id);
            if let Some(service_id) = object.parent_id {
                params.insert("service_id".to_string(), service_id);
            }
            if let Some(cluster_id) = object.cluster_id {
                params.insert("cluster_id".to_string(), cluster_id);
            }
        }
        ObjectType::Provider => {
            params.insert("provider_id".to_string(), object.id);
        }
        ObjectType::Host => {
            params.insert("host_id".to_string(), object.id);
            if let Some(provider_id) = object.parent_id {
                params.insert("provider_id".to_string(), provider_id);
            }
        }
        ObjectType::Adcm => {
            params.insert("adcm_id".to_string(), object.id);
        }
    }
    PlaceholderObject {
        object_type: object.object_type.as_str().to_string(),
        name: object.name.clone(),
        params,
    }
}

fn job_placeholder(task_id: i64, action_name: &str) -> PlaceholderObject {
    PlaceholderObject {
        object_type: "task".to_string(),
        name: action_name.to_string(),
        params: BTreeMap::from([("task_id".to_string(), task_id)]),
    }
}

fn with_source(message: &str, source: &ObjectRecord) -> ConcernReason {
    ConcernReason {
        message: message.to_string(),
        placeholder: BTreeMap::from([("source".to_string(), placeholder(source))]),
    }
}

pub fn issue(cause: ConcernCause, source: &ObjectRecord) -> ConcernReason {
    let message = match cause {
        ConcernCause::Config => "${source} has an issue with its config",
        ConcernCause::Import => "${source} has an issue with required import",
        ConcernCause::Service => "${source} has an issue with required service",
        ConcernCause::HostComponent => "${source} has an issue with host-component mapping",
        ConcernCause::Requirement => "${source} has an issue with requirement. Need to be installed",
    };
    with_source(message, source)
}

pub fn lock(target: &ObjectRecord, task_id: i64, action_name: &str) -> ConcernReason {
    ConcernReason {
        message: "Object locked by running task ${job} on ${target}".to_string(),
        placeholder: BTreeMap::from([
            ("target".to_string(), placeholder(target)),
            ("job".to_string(), job_placeholder(task_id, action_name)),
        ]),
    }
}

pub fn flag(source: &ObjectRecord, message: &str) -> ConcernReason {
    if message.is_empty() {
        with_source("${source} has an outdated configuration", source)
    } else {
        with_source(&format!("${{source}} has a flag: {}", message), source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn component() -> ObjectRecord {
        ObjectRecord {
            id: 9,
            object_type: ObjectType::Component,
            prototype_id: 1,
            name: "cmp".to_string(),
            description: String::new(),
            parent_id: Some(4),
            cluster_id: Some(2),
            state: "created".to_string(),
            multi_state: BTreeSet::new(),
            config_root_id: None,
            maintenance_mode: Default::default(),
            before_upgrade: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_placeholder_id_chain() {
        let p = placeholder(&component());
        assert_eq!(p.object_type, "component");
        assert_eq!(p.params["component_id"], 9);
        assert_eq!(p.params["service_id"], 4);
        assert_eq!(p.params["cluster_id"], 2);
    }

    #[test]
    fn test_lock_reason_names_action() {
        let reason = lock(&component(), 15, "install");
        assert_eq!(reason.render(), "Object locked by running task install on cmp");
    }

    #[test]
    fn test_flag_reason() {
        assert_eq!(flag(&component(), "").render(), "cmp has an outdated configuration");
        assert_eq!(flag(&component(), "restart").render(), "cmp has a flag: restart");
    }
}
