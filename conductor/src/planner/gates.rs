//! State availability gates of an action.

use std::collections::BTreeSet;

use crate::catalog::definition::ActionSpec;

/// Why an action is not available, or `Ok` when it is.
///
/// Without `state_available` an action is never available; without
/// `multi_state_available` any multi_state passes.
pub fn check_available(
    spec: &ActionSpec,
    state: &str,
    multi_state: &BTreeSet<String>,
) -> Result<(), String> {
    match &spec.state_available {
        Some(gate) if gate.contains(state) => {}
        Some(_) => return Err(format!("state '{}' is not in state_available", state)),
        None => return Err("action declares no state_available".to_string()),
    }

    if let Some(gate) = &spec.multi_state_available {
        if !gate.intersects(multi_state) {
            return Err(format!(
                "multi_state {:?} does not match multi_state_available",
                multi_state
            ));
        }
    }

    if let Some(gate) = &spec.state_unavailable {
        if gate.contains(state) {
            return Err(format!("state '{}' is in state_unavailable", state));
        }
    }

    if let Some(gate) = &spec.multi_state_unavailable {
        if gate.intersects(multi_state) {
            return Err(format!(
                "multi_state {:?} matches multi_state_unavailable",
                multi_state
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::definition::StateGate;
    use rstest::rstest;

    fn spec(yaml: &str) -> ActionSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn states(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case("state_available: any", "created", true)]
    #[case("state_available: [created]", "created", true)]
    #[case("state_available: [installed]", "created", false)]
    #[case("{}", "created", false)]
    #[case("{state_available: any, state_unavailable: [created]}", "created", false)]
    #[case("{state_available: any, state_unavailable: any}", "installed", false)]
    fn test_state_gate(#[case] yaml: &str, #[case] state: &str, #[case] available: bool) {
        let action = spec("{type: job, script: a.yaml, script_type: ansible}");
        let gates = spec(yaml);
        let action = ActionSpec {
            state_available: gates.state_available,
            state_unavailable: gates.state_unavailable,
            ..action
        };
        assert_eq!(check_available(&action, state, &states(&[])).is_ok(), available);
    }

    #[test]
    fn test_multi_state_gates() {
        let mut action = spec("{type: job, script: a.yaml, script_type: ansible, state_available: any}");
        assert!(check_available(&action, "created", &states(&[])).is_ok());

        action.multi_state_available = Some(StateGate::List(vec!["ready".into()]));
        assert!(check_available(&action, "created", &states(&[])).is_err());
        assert!(check_available(&action, "created", &states(&["ready", "x"])).is_ok());

        action.multi_state_unavailable = Some(StateGate::List(vec!["x".into()]));
        let err = check_available(&action, "created", &states(&["ready", "x"])).unwrap_err();
        assert!(err.contains("multi_state_unavailable"));
    }
}
