//! Declarative bundle contents as produced by the bundle parser.
//!
//! A bundle is a YAML sequence of prototype entries. Only the already parsed
//! shape is consumed here; acceptance checks run in [`BundleDefinition::validate`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::errors::ConductorError;
use crate::params::schema::{ConfigDefinition, FieldSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrototypeType {
    Cluster,
    Service,
    Component,
    Provider,
    Host,
    Adcm,
}

impl PrototypeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrototypeType::Cluster => "cluster",
            PrototypeType::Service => "service",
            PrototypeType::Component => "component",
            PrototypeType::Provider => "provider",
            PrototypeType::Host => "host",
            PrototypeType::Adcm => "adcm",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "cluster" => Ok(PrototypeType::Cluster),
            "service" => Ok(PrototypeType::Service),
            "component" => Ok(PrototypeType::Component),
            "provider" => Ok(PrototypeType::Provider),
            "host" => Ok(PrototypeType::Host),
            "adcm" => Ok(PrototypeType::Adcm),
            other => Err(anyhow::anyhow!("Unknown prototype type: {}", other)),
        }
    }
}

impl fmt::Display for PrototypeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKeyword {
    Any,
}

/// `"any"` or an explicit list of states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateGate {
    Keyword(GateKeyword),
    List(Vec<String>),
}

impl StateGate {
    pub fn any() -> Self {
        StateGate::Keyword(GateKeyword::Any)
    }

    pub fn contains(&self, state: &str) -> bool {
        match self {
            StateGate::Keyword(GateKeyword::Any) => true,
            StateGate::List(states) => states.iter().any(|s| s == state),
        }
    }

    /// True when any member of `states` is listed (or the gate is `any`)
    pub fn intersects(&self, states: &BTreeSet<String>) -> bool {
        match self {
            StateGate::Keyword(GateKeyword::Any) => true,
            StateGate::List(list) => list.iter().any(|s| states.contains(s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Monitoring {
    #[default]
    Active,
    Passive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub service: String,
    #[serde(default)]
    pub component: Option<String>,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(component) => write!(f, "{}.{}", self.service, component),
            None => write!(f, "{}", self.service),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundTo {
    pub service: String,
    pub component: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintItem {
    Count(i64),
    Keyword(String),
}

impl fmt::Display for ConstraintItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintItem::Count(n) => write!(f, "{}", n),
            ConstraintItem::Keyword(k) => write!(f, "{}", k),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub multibind: bool,
    #[serde(default)]
    pub versions: VersionBounds,
}

/// Declarative fields shared by every prototype kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrototypeSpec {
    #[serde(default)]
    pub requires: Vec<Requirement>,
    #[serde(default)]
    pub bound_to: Option<BoundTo>,
    #[serde(default)]
    pub constraint: Option<Vec<ConstraintItem>>,
    #[serde(default)]
    pub monitoring: Monitoring,
    /// Service must be present in every cluster of the bundle
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub allow_maintenance_mode: bool,
    #[serde(default)]
    pub config_group_customization: bool,
    #[serde(default = "default_venv")]
    pub venv: String,
    #[serde(default)]
    pub config: Option<ConfigDefinition>,
    #[serde(default)]
    pub import: BTreeMap<String, ImportSpec>,
    #[serde(default)]
    pub export: Vec<String>,
}

fn default_venv() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    #[default]
    Job,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Ansible,
    Python,
    Internal,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Ansible => "ansible",
            ScriptType::Python => "python",
            ScriptType::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HcAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HcAclRule {
    pub service: String,
    pub component: String,
    pub action: HcAction,
}

/// State mutation applied on action success or failure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEffect {
    #[serde(default)]
    pub set_state: Option<String>,
    #[serde(default)]
    pub set_multi_state: Vec<String>,
    #[serde(default)]
    pub unset_multi_state: Vec<String>,
}

impl StateEffect {
    pub fn is_empty(&self) -> bool {
        self.set_state.is_none() && self.set_multi_state.is_empty() && self.unset_multi_state.is_empty()
    }
}

/// One script invocation inside an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubactionSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub script: String,
    pub script_type: ScriptType,
    #[serde(default)]
    pub state_on_fail: Option<String>,
    #[serde(default)]
    pub multi_state_on_fail_set: Vec<String>,
    #[serde(default)]
    pub multi_state_on_fail_unset: Vec<String>,
    #[serde(default)]
    pub allow_to_terminate: Option<bool>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub action_type: ActionType,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub script_type: Option<ScriptType>,
    #[serde(default)]
    pub scripts: Vec<SubactionSpec>,
    #[serde(default)]
    pub scripts_jinja: Option<String>,
    #[serde(default)]
    pub config_jinja: Option<String>,
    #[serde(default)]
    pub state_available: Option<StateGate>,
    #[serde(default)]
    pub multi_state_available: Option<StateGate>,
    #[serde(default)]
    pub state_unavailable: Option<StateGate>,
    #[serde(default)]
    pub multi_state_unavailable: Option<StateGate>,
    #[serde(default)]
    pub on_success: Option<StateEffect>,
    #[serde(default)]
    pub on_fail: Option<StateEffect>,
    #[serde(default)]
    pub host_action: bool,
    #[serde(default)]
    pub allow_to_terminate: bool,
    #[serde(default)]
    pub allow_for_action_host_group: bool,
    #[serde(default)]
    pub allow_in_maintenance_mode: bool,
    #[serde(default)]
    pub partial_execution: bool,
    /// Non-blocking actions start without taking a LOCK concern
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default)]
    pub config: Option<ConfigDefinition>,
    #[serde(default)]
    pub hc_acl: Vec<HcAclRule>,
    #[serde(default)]
    pub venv: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl ActionSpec {
    /// Static job list; `scripts_jinja` actions are expanded by the planner
    pub fn static_subactions(&self, action_name: &str) -> Vec<SubactionSpec> {
        match self.action_type {
            ActionType::Task => self.scripts.clone(),
            ActionType::Job => match (&self.script, self.script_type) {
                (Some(script), Some(script_type)) => vec![SubactionSpec {
                    name: action_name.to_string(),
                    display_name: self.display_name.clone(),
                    script: script.clone(),
                    script_type,
                    state_on_fail: None,
                    multi_state_on_fail_set: Vec::new(),
                    multi_state_on_fail_unset: Vec::new(),
                    allow_to_terminate: Some(self.allow_to_terminate),
                    params: self.params.clone(),
                }],
                _ => Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBounds {
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
    #[serde(default)]
    pub min_strict: Option<String>,
    #[serde(default)]
    pub max_strict: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStates {
    #[serde(default = "StateGate::any")]
    pub available: StateGate,
    #[serde(default)]
    pub on_success: Option<String>,
}

impl Default for UpgradeStates {
    fn default() -> Self {
        Self {
            available: StateGate::any(),
            on_success: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub versions: VersionBounds,
    #[serde(default = "default_editions")]
    pub from_edition: Vec<String>,
    #[serde(default)]
    pub states: UpgradeStates,
    /// When present the upgrade runs as an action; `bundle_switch` must be one of the steps
    #[serde(default)]
    pub scripts: Vec<SubactionSpec>,
    #[serde(default)]
    pub config: Option<ConfigDefinition>,
    #[serde(default)]
    pub hc_acl: Vec<HcAclRule>,
}

fn default_editions() -> Vec<String> {
    vec!["community".to_string()]
}

impl UpgradeSpec {
    /// Action that carries out an upgrade declared with `scripts`
    pub fn to_action_spec(&self) -> ActionSpec {
        ActionSpec {
            display_name: self.display_name.clone().or_else(|| Some(self.name.clone())),
            description: None,
            action_type: ActionType::Task,
            script: None,
            script_type: None,
            scripts: self.scripts.clone(),
            scripts_jinja: None,
            config_jinja: None,
            state_available: Some(self.states.available.clone()),
            multi_state_available: Some(StateGate::any()),
            state_unavailable: None,
            multi_state_unavailable: None,
            on_success: self.states.on_success.as_ref().map(|state| StateEffect {
                set_state: Some(state.clone()),
                ..StateEffect::default()
            }),
            on_fail: None,
            host_action: false,
            allow_to_terminate: false,
            allow_for_action_host_group: false,
            allow_in_maintenance_mode: false,
            partial_execution: false,
            blocking: true,
            config: self.config.clone(),
            hc_acl: self.hc_acl.clone(),
            venv: None,
            params: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub spec: PrototypeSpec,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionSpec>,
}

/// One prototype entry of a bundle config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeDefinition {
    #[serde(rename = "type")]
    pub prototype_type: PrototypeType,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub edition: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(flatten)]
    pub spec: PrototypeSpec,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionSpec>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentDefinition>,
    #[serde(default)]
    pub upgrade: Vec<UpgradeSpec>,
}

/// Parsed bundle plus its content hash
#[derive(Debug, Clone)]
pub struct BundleDefinition {
    pub hash: String,
    pub prototypes: Vec<PrototypeDefinition>,
}

impl BundleDefinition {
    /// Parse a bundle config file; the hash is the SHA-256 of the text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let prototypes: Vec<PrototypeDefinition> =
            serde_yaml::from_str(text).map_err(|e| ConductorError::Bundle {
                reason: format!("Failed to parse bundle definition: {}", e),
            })?;

        let digest = Sha256::digest(text.as_bytes());
        let hash = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();

        Ok(Self { hash, prototypes })
    }

    /// Cluster or provider entry that names the bundle
    pub fn main_prototype(&self) -> Option<&PrototypeDefinition> {
        self.prototypes
            .iter()
            .find(|p| matches!(p.prototype_type, PrototypeType::Cluster | PrototypeType::Provider))
    }

    pub fn name(&self) -> String {
        self.main_prototype()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "unnamed".to_string())
    }

    pub fn version(&self) -> String {
        self.main_prototype()
            .map(|p| p.version.clone())
            .unwrap_or_else(|| "0".to_string())
    }

    pub fn edition(&self) -> String {
        self.main_prototype()
            .and_then(|p| p.edition.clone())
            .unwrap_or_else(|| "community".to_string())
    }

    /// Acceptance checks applied before anything is written to the catalog
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<(PrototypeType, &str)> = HashSet::new();
        let mut clusters = 0;
        let mut providers = 0;

        for proto in &self.prototypes {
            if !seen.insert((proto.prototype_type, proto.name.as_str())) {
                return Err(bundle_error(format!(
                    "Duplicate {} prototype '{}'",
                    proto.prototype_type, proto.name
                )));
            }
            match proto.prototype_type {
                PrototypeType::Cluster => clusters += 1,
                PrototypeType::Provider => providers += 1,
                PrototypeType::Component => {
                    return Err(bundle_error(format!(
                        "Component '{}' must be declared inside a service",
                        proto.name
                    )))
                }
                _ => {}
            }
            if proto.prototype_type != PrototypeType::Service && !proto.components.is_empty() {
                return Err(bundle_error(format!(
                    "Only services can declare components ('{}')",
                    proto.name
                )));
            }
        }

        if clusters > 1 || providers > 1 {
            return Err(bundle_error(
                "A bundle declares at most one cluster and one provider".to_string(),
            ));
        }
        let has_services = self
            .prototypes
            .iter()
            .any(|p| p.prototype_type == PrototypeType::Service);
        if has_services && clusters == 0 {
            return Err(bundle_error("Services require a cluster prototype".to_string()));
        }
        let has_hosts = self
            .prototypes
            .iter()
            .any(|p| p.prototype_type == PrototypeType::Host);
        if has_hosts && providers == 0 {
            return Err(bundle_error("Hosts require a provider prototype".to_string()));
        }

        let components = self.component_index();

        for proto in &self.prototypes {
            let owner = format!("{} '{}'", proto.prototype_type, proto.name);
            validate_spec(&owner, &proto.spec, &components, self)?;
            for (action_name, action) in &proto.actions {
                validate_action(&owner, action_name, action, &components)?;
            }
            for (component_name, component) in &proto.components {
                let owner = format!("component '{}.{}'", proto.name, component_name);
                validate_spec(&owner, &component.spec, &components, self)?;
                for (action_name, action) in &component.actions {
                    validate_action(&owner, action_name, action, &components)?;
                }
            }
            for upgrade in &proto.upgrade {
                if let Some(config) = &upgrade.config {
                    validate_config(&format!("upgrade '{}'", upgrade.name), config)?;
                }
                if !upgrade.scripts.is_empty()
                    && !upgrade
                        .scripts
                        .iter()
                        .any(|s| s.script_type == ScriptType::Internal && s.script == "bundle_switch")
                {
                    return Err(bundle_error(format!(
                        "Upgrade '{}' with scripts must contain a bundle_switch step",
                        upgrade.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn component_index(&self) -> HashSet<(String, String)> {
        let mut index = HashSet::new();
        for proto in &self.prototypes {
            for component_name in proto.components.keys() {
                index.insert((proto.name.clone(), component_name.clone()));
            }
        }
        index
    }

    fn has_service(&self, name: &str) -> bool {
        self.prototypes
            .iter()
            .any(|p| p.prototype_type == PrototypeType::Service && p.name == name)
    }
}

fn bundle_error(reason: String) -> anyhow::Error {
    ConductorError::Bundle { reason }.into()
}

fn validate_spec(
    owner: &str,
    spec: &PrototypeSpec,
    components: &HashSet<(String, String)>,
    bundle: &BundleDefinition,
) -> Result<()> {
    if let Some(config) = &spec.config {
        validate_config(owner, config)?;
    }
    if let Some(bound) = &spec.bound_to {
        if !components.contains(&(bound.service.clone(), bound.component.clone())) {
            return Err(bundle_error(format!(
                "{} is bound to unknown component {}.{}",
                owner, bound.service, bound.component
            )));
        }
    }
    for requirement in &spec.requires {
        let known = match &requirement.component {
            Some(component) => {
                components.contains(&(requirement.service.clone(), component.clone()))
            }
            None => bundle.has_service(&requirement.service),
        };
        if !known {
            return Err(bundle_error(format!(
                "{} requires unknown {}",
                owner, requirement
            )));
        }
    }
    if let Some(constraint) = &spec.constraint {
        crate::topology::constraint::HostConstraint::parse(constraint)
            .map_err(|e| bundle_error(format!("{} has invalid constraint: {}", owner, e)))?;
    }
    Ok(())
}

fn validate_action(
    owner: &str,
    name: &str,
    action: &ActionSpec,
    components: &HashSet<(String, String)>,
) -> Result<()> {
    let label = format!("action '{}' of {}", name, owner);

    if action.config.is_some() && action.config_jinja.is_some() {
        return Err(bundle_error(format!(
            "{} declares both config and config_jinja",
            label
        )));
    }
    if !action.scripts.is_empty() && action.scripts_jinja.is_some() {
        return Err(bundle_error(format!(
            "{} declares both scripts and scripts_jinja",
            label
        )));
    }
    for template in [&action.scripts_jinja, &action.config_jinja].into_iter().flatten() {
        if template.ends_with(".py") {
            return Err(bundle_error(format!(
                "{}: python entrypoint templates are not supported ({})",
                label, template
            )));
        }
    }
    match action.action_type {
        ActionType::Job => {
            if action.script.is_none() || action.script_type.is_none() {
                return Err(bundle_error(format!(
                    "{} of type job needs script and script_type",
                    label
                )));
            }
        }
        ActionType::Task => {
            if action.scripts.is_empty() && action.scripts_jinja.is_none() {
                return Err(bundle_error(format!(
                    "{} of type task needs scripts or scripts_jinja",
                    label
                )));
            }
        }
    }
    if let Some(config) = &action.config {
        validate_config(&label, config)?;
    }
    for rule in &action.hc_acl {
        if !components.contains(&(rule.service.clone(), rule.component.clone())) {
            return Err(bundle_error(format!(
                "{} has hc_acl rule for unknown component {}.{}",
                label, rule.service, rule.component
            )));
        }
    }
    Ok(())
}

fn validate_config(owner: &str, config: &ConfigDefinition) -> Result<()> {
    let mut names = HashSet::new();
    for field in &config.fields {
        if !names.insert(field.name.as_str()) {
            return Err(bundle_error(format!(
                "{} config declares '{}' twice",
                owner, field.name
            )));
        }
        validate_field(owner, field, true)?;
    }
    Ok(())
}

fn validate_field(owner: &str, field: &FieldSpec, top_level: bool) -> Result<()> {
    use crate::params::schema::FieldType;

    if field.read_only.is_some() && field.writable.is_some() {
        return Err(bundle_error(format!(
            "{} config field '{}' declares both read_only and writable",
            owner, field.name
        )));
    }
    match field.field_type {
        FieldType::Group => {
            if !top_level {
                return Err(bundle_error(format!(
                    "{} config group '{}' cannot be nested",
                    owner, field.name
                )));
            }
            let mut names = HashSet::new();
            for sub in &field.subs {
                if !names.insert(sub.name.as_str()) {
                    return Err(bundle_error(format!(
                        "{} config group '{}' declares '{}' twice",
                        owner, field.name, sub.name
                    )));
                }
                validate_field(owner, sub, false)?;
            }
        }
        FieldType::Option => {
            if field.limits.option.as_ref().map_or(true, |o| o.is_empty()) {
                return Err(bundle_error(format!(
                    "{} option field '{}' needs limits.option",
                    owner, field.name
                )));
            }
        }
        _ => {
            if field.activatable {
                return Err(bundle_error(format!(
                    "{} field '{}' is activatable but not a group",
                    owner, field.name
                )));
            }
        }
    }
    Ok(())
}
