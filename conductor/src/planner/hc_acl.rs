//! Host-component whitelist of an action.

use crate::catalog::definition::{HcAclRule, HcAction};
use crate::database::{HcDelta, HcEntry};
use crate::errors::ConductorError;
use crate::topology::Topology;

fn allowed(rules: &[HcAclRule], service: &str, component: &str, action: HcAction) -> bool {
    rules
        .iter()
        .any(|r| r.action == action && r.service == service && r.component == component)
}

fn check_entries(
    topology: &Topology,
    rules: &[HcAclRule],
    entries: &[HcEntry],
    action: HcAction,
) -> Result<(), ConductorError> {
    for entry in entries {
        let Some((service, component)) = topology.component(entry.component_id) else {
            return Err(ConductorError::WrongActionHc {
                reason: format!("component #{} is not in the cluster", entry.component_id),
            });
        };
        let (service_name, component_name) = (&service.prototype.name, &component.prototype.name);
        if !allowed(rules, service_name, component_name, action) {
            let verb = match action {
                HcAction::Add => "add",
                HcAction::Remove => "remove",
            };
            return Err(ConductorError::WrongActionHc {
                reason: format!(
                    "no permission to {} {}.{} on host {}",
                    verb,
                    service_name,
                    component_name,
                    topology.fqdn(entry.host_id)
                ),
            });
        }
    }
    Ok(())
}

/// Every added and removed entry of `delta` must be permitted by `rules`
pub fn check_hc_acl(topology: &Topology, rules: &[HcAclRule], delta: &HcDelta) -> Result<(), ConductorError> {
    if rules.is_empty() {
        return Err(ConductorError::WrongActionHc {
            reason: "action does not accept a host-component map".to_string(),
        });
    }
    check_entries(topology, rules, &delta.add, HcAction::Add)?;
    check_entries(topology, rules, &delta.remove, HcAction::Remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::mapping::tests::sample_topology;

    fn rule(component: &str, action: HcAction) -> HcAclRule {
        HcAclRule {
            service: "db".into(),
            component: component.into(),
            action,
        }
    }

    fn entry(host_id: i64, component_id: i64) -> HcEntry {
        HcEntry {
            host_id,
            service_id: 2,
            component_id,
        }
    }

    #[test]
    fn test_permitted_add() {
        let topology = sample_topology();
        let delta = HcDelta {
            current: vec![entry(101, 21)],
            add: vec![entry(102, 21)],
            remove: vec![],
        };
        assert!(check_hc_acl(&topology, &[rule("master", HcAction::Add)], &delta).is_ok());
    }

    #[test]
    fn test_remove_needs_its_own_rule() {
        let topology = sample_topology();
        let delta = HcDelta {
            current: vec![entry(101, 21)],
            add: vec![],
            remove: vec![entry(101, 21)],
        };
        let err = check_hc_acl(&topology, &[rule("master", HcAction::Add)], &delta).unwrap_err();
        assert_eq!(err.code(), "WRONG_ACTION_HC");
        assert!(err.to_string().contains("remove db.master on host h1"));
    }

    #[test]
    fn test_no_rules_rejects_any_map() {
        let topology = sample_topology();
        let err = check_hc_acl(&topology, &[], &HcDelta::default()).unwrap_err();
        assert_eq!(err.code(), "WRONG_ACTION_HC");
    }
}
