//! Domain error types for the control plane
//!
//! Every variant carries a stable string code (`code()`) used by callers and
//! plugin responses, and a coarse kind (`kind()`) that decides how the
//! scheduler and the HTTP boundary react. Errors travel inside `anyhow::Error`
//! and are recovered with `downcast_ref::<ConductorError>()`.

use std::fmt;

/// Coarse error classes used for recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    NotFound,
    ConcernBlocked,
    Execution,
    Liveness,
    Internal,
}

/// Main error type for the control plane
#[derive(Debug, Clone)]
pub enum ConductorError {
    /// Referenced object does not exist
    ObjectNotFound { object: String },

    /// Referenced prototype, action or upgrade does not exist
    PrototypeNotFound { name: String },

    /// Host already belongs to another cluster, or is still mapped
    HostConflict { host: String, reason: String },

    /// Host is not attached to the cluster it is being mapped into
    ForeignHost { host: String, cluster: String },

    /// Name uniqueness violated
    NameConflict { kind: String, name: String },

    /// Component host-count constraint is not satisfied
    ComponentConstraint {
        component: String,
        constraint: String,
        reason: String,
    },

    /// A declared requirement has no counterpart in the cluster
    Requires { source: String, requirement: String },

    /// `bound_to` target is missing on a host
    Bind {
        host: String,
        service: String,
        component: String,
        bound_from: String,
    },

    /// Action start refused because of a blocking concern
    TaskBlocked { object: String, reason: String },

    /// Action is not available for the object in its current state
    ActionUnavailable { action: String, reason: String },

    /// Host-component payload is not allowed by the action
    WrongActionHc { reason: String },

    /// Object is in maintenance mode and the action does not allow it
    MaintenanceMode { object: String, action: String },

    /// Unknown or forbidden config key
    ConfigKey { key: String, reason: String },

    /// Config value failed validation
    ConfigValue { key: String, reason: String },

    /// No config is defined where one was required
    ConfigNotFound { object: String },

    /// Bundle definition rejected at load time
    Bundle { reason: String },

    /// Job list could not be produced (template render errors and the like)
    TaskGenerator { reason: String },

    /// Authorization predicate denied the request
    Authorization { user: String, action: String },

    /// Task cannot be terminated
    NotAllowedTermination { task_id: i64, reason: String },

    /// Upgrade not applicable
    Upgrade { reason: String },

    /// Plugin callback rejected
    Plugin { reason: String },

    /// Object cannot be removed while concerns reference it
    IssueIntegrity { object: String, reason: String },

    /// Executor reported an unrecoverable failure
    Execution { reason: String },

    /// Worker vanished or a task row is stale
    Liveness { reason: String },

    /// Unexpected internal failure
    Internal { reason: String },
}

impl ConductorError {
    pub fn code(&self) -> &'static str {
        match self {
            ConductorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConductorError::PrototypeNotFound { .. } => "PROTOTYPE_NOT_FOUND",
            ConductorError::HostConflict { .. } => "HOST_CONFLICT",
            ConductorError::ForeignHost { .. } => "FOREIGN_HOST",
            ConductorError::NameConflict { .. } => "NAME_CONFLICT",
            ConductorError::ComponentConstraint { .. } => "COMPONENT_CONSTRAINT_ERROR",
            ConductorError::Requires { .. } => "REQUIRES_ERROR",
            ConductorError::Bind { .. } => "BIND_ERROR",
            ConductorError::TaskBlocked { .. } => "TASK_ERROR",
            ConductorError::ActionUnavailable { .. } => "ACTION_ERROR",
            ConductorError::WrongActionHc { .. } => "WRONG_ACTION_HC",
            ConductorError::MaintenanceMode { .. } => "MAINTENANCE_MODE",
            ConductorError::ConfigKey { .. } => "CONFIG_KEY_ERROR",
            ConductorError::ConfigValue { .. } => "CONFIG_VALUE_ERROR",
            ConductorError::ConfigNotFound { .. } => "CONFIG_NOT_FOUND",
            ConductorError::Bundle { .. } => "BUNDLE_ERROR",
            ConductorError::TaskGenerator { .. } => "TASK_GENERATOR_ERROR",
            ConductorError::Authorization { .. } => "AUTH_ERROR",
            ConductorError::NotAllowedTermination { .. } => "NOT_ALLOWED_TERMINATION",
            ConductorError::Upgrade { .. } => "UPGRADE_ERROR",
            ConductorError::Plugin { .. } => "PLUGIN_ERROR",
            ConductorError::IssueIntegrity { .. } => "ISSUE_INTEGRITY_ERROR",
            ConductorError::Execution { .. } => "EXECUTION_ERROR",
            ConductorError::Liveness { .. } => "LIVENESS_ERROR",
            ConductorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::ObjectNotFound { .. }
            | ConductorError::PrototypeNotFound { .. }
            | ConductorError::ConfigNotFound { .. } => ErrorKind::NotFound,
            ConductorError::HostConflict { .. }
            | ConductorError::NameConflict { .. }
            | ConductorError::IssueIntegrity { .. } => ErrorKind::Conflict,
            ConductorError::Authorization { .. } => ErrorKind::Authorization,
            ConductorError::TaskBlocked { .. } => ErrorKind::ConcernBlocked,
            ConductorError::Execution { .. } | ConductorError::Plugin { .. } => {
                ErrorKind::Execution
            }
            ConductorError::Liveness { .. } => ErrorKind::Liveness,
            ConductorError::Internal { .. } => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }

    /// Expected errors are the ones a re-validation may legitimately raise;
    /// anything else during scheduling marks the task BROKEN.
    pub fn is_expected(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Internal | ErrorKind::Liveness)
    }
}

/// Extract the domain error from an `anyhow::Error`, if there is one
pub fn domain_error(err: &anyhow::Error) -> Option<&ConductorError> {
    err.downcast_ref::<ConductorError>()
}

/// Error code of an `anyhow::Error`, `INTERNAL_ERROR` when untyped
pub fn error_code(err: &anyhow::Error) -> &'static str {
    domain_error(err).map(|e| e.code()).unwrap_or("INTERNAL_ERROR")
}

impl fmt::Display for ConductorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.code())?;
        match self {
            ConductorError::ObjectNotFound { object } => write!(f, "{} does not exist", object),
            ConductorError::PrototypeNotFound { name } => {
                write!(f, "prototype {} does not exist", name)
            }
            ConductorError::HostConflict { host, reason } => {
                write!(f, "host {} {}", host, reason)
            }
            ConductorError::ForeignHost { host, cluster } => {
                write!(f, "host {} is not attached to cluster {}", host, cluster)
            }
            ConductorError::NameConflict { kind, name } => {
                write!(f, "{} with name '{}' already exists", kind, name)
            }
            ConductorError::ComponentConstraint {
                component,
                constraint,
                reason,
            } => write!(
                f,
                "component {} violates constraint {}: {}",
                component, constraint, reason
            ),
            ConductorError::Requires {
                source,
                requirement,
            } => write!(f, "{} requires {} which is not present", source, requirement),
            ConductorError::Bind {
                host,
                service,
                component,
                bound_from,
            } => write!(
                f,
                "component {} is bound to {}.{} which is not mapped on host {}",
                bound_from, service, component, host
            ),
            ConductorError::TaskBlocked { object, reason } => {
                write!(f, "{} has blocking concern: {}", object, reason)
            }
            ConductorError::ActionUnavailable { action, reason } => {
                write!(f, "action {} is not available: {}", action, reason)
            }
            ConductorError::WrongActionHc { reason } => write!(f, "{}", reason),
            ConductorError::MaintenanceMode { object, action } => write!(
                f,
                "{} is in maintenance mode and action {} is not allowed there",
                object, action
            ),
            ConductorError::ConfigKey { key, reason } => {
                write!(f, "config key '{}': {}", key, reason)
            }
            ConductorError::ConfigValue { key, reason } => {
                write!(f, "config value of '{}': {}", key, reason)
            }
            ConductorError::ConfigNotFound { object } => {
                write!(f, "{} has no config", object)
            }
            ConductorError::Bundle { reason } => write!(f, "{}", reason),
            ConductorError::TaskGenerator { reason } => write!(f, "{}", reason),
            ConductorError::Authorization { user, action } => {
                write!(f, "user {} is not allowed to run {}", user, action)
            }
            ConductorError::NotAllowedTermination { task_id, reason } => {
                write!(f, "task #{} cannot be terminated: {}", task_id, reason)
            }
            ConductorError::Upgrade { reason } => write!(f, "{}", reason),
            ConductorError::Plugin { reason } => write!(f, "{}", reason),
            ConductorError::IssueIntegrity { object, reason } => {
                write!(f, "{}: {}", object, reason)
            }
            ConductorError::Execution { reason } => write!(f, "{}", reason),
            ConductorError::Liveness { reason } => write!(f, "{}", reason),
            ConductorError::Internal { reason } => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for ConductorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_survives_anyhow() {
        let err: anyhow::Error = ConductorError::Bind {
            host: "h3".into(),
            service: "db".into(),
            component: "master".into(),
            bound_from: "agent".into(),
        }
        .into();

        assert_eq!(error_code(&err), "BIND_ERROR");
        let text = err.to_string();
        assert!(text.contains("h3"));
        assert!(text.contains("master"));
    }

    #[test]
    fn test_untyped_error_is_internal() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(error_code(&err), "INTERNAL_ERROR");
    }

    #[test]
    fn test_kinds() {
        let blocked = ConductorError::TaskBlocked {
            object: "cluster Test".into(),
            reason: "locked".into(),
        };
        assert_eq!(blocked.kind(), ErrorKind::ConcernBlocked);
        assert!(blocked.is_expected());

        let internal = ConductorError::Internal {
            reason: "x".into(),
        };
        assert!(!internal.is_expected());
    }
}
