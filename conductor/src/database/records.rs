//! Database record types (entities).
//!
//! Complex values are kept as typed Rust structures here and serialized to
//! JSON text columns at the persistence boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::catalog::definition::{
    ActionSpec, PrototypeSpec, PrototypeType, SubactionSpec, UpgradeSpec,
};
use crate::config::ExecutionEnvironment;

// ============================================================================
// Object identity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Cluster,
    Service,
    Component,
    Provider,
    Host,
    Adcm,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Cluster => "cluster",
            ObjectType::Service => "service",
            ObjectType::Component => "component",
            ObjectType::Provider => "provider",
            ObjectType::Host => "host",
            ObjectType::Adcm => "adcm",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "cluster" => Ok(ObjectType::Cluster),
            "service" => Ok(ObjectType::Service),
            "component" => Ok(ObjectType::Component),
            "provider" => Ok(ObjectType::Provider),
            "host" => Ok(ObjectType::Host),
            "adcm" => Ok(ObjectType::Adcm),
            other => Err(anyhow::anyhow!("Unknown object type: {}", other)),
        }
    }
}

impl From<PrototypeType> for ObjectType {
    fn from(value: PrototypeType) -> Self {
        match value {
            PrototypeType::Cluster => ObjectType::Cluster,
            PrototypeType::Service => ObjectType::Service,
            PrototypeType::Component => ObjectType::Component,
            PrototypeType::Provider => ObjectType::Provider,
            PrototypeType::Host => ObjectType::Host,
            PrototypeType::Adcm => ObjectType::Adcm,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit polymorphic reference to a model object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub id: i64,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, id: i64) -> Self {
        Self { object_type, id }
    }

    pub fn cluster(id: i64) -> Self {
        Self::new(ObjectType::Cluster, id)
    }

    pub fn service(id: i64) -> Self {
        Self::new(ObjectType::Service, id)
    }

    pub fn component(id: i64) -> Self {
        Self::new(ObjectType::Component, id)
    }

    pub fn provider(id: i64) -> Self {
        Self::new(ObjectType::Provider, id)
    }

    pub fn host(id: i64) -> Self {
        Self::new(ObjectType::Host, id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.object_type, self.id)
    }
}

/// Ordered OFF < CHANGING < ON so that effective values are a plain `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceMode {
    #[default]
    Off,
    Changing,
    On,
}

impl MaintenanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceMode::Off => "off",
            MaintenanceMode::Changing => "changing",
            MaintenanceMode::On => "on",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "off" => Ok(MaintenanceMode::Off),
            "changing" => Ok(MaintenanceMode::Changing),
            "on" => Ok(MaintenanceMode::On),
            other => Err(anyhow::anyhow!("Unknown maintenance mode: {}", other)),
        }
    }
}

// ============================================================================
// Catalog entities
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRecord {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub edition: String,
    pub hash: String,
    pub license: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrototypeRecord {
    pub id: i64,
    pub bundle_id: i64,
    pub prototype_type: PrototypeType,
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub parent_id: Option<i64>,
    pub spec: PrototypeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: i64,
    pub prototype_id: i64,
    pub name: String,
    /// Set for actions generated from an upgrade's `scripts`
    pub upgrade_id: Option<i64>,
    pub spec: ActionSpec,
}

impl ActionRecord {
    pub fn display_name(&self) -> String {
        self.spec
            .display_name
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRecord {
    pub id: i64,
    pub bundle_id: i64,
    pub name: String,
    pub action_id: Option<i64>,
    pub spec: UpgradeSpec,
}

// ============================================================================
// Model objects
// ============================================================================

/// Row of the unified `objects` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: i64,
    pub object_type: ObjectType,
    pub prototype_id: i64,
    pub name: String,
    pub description: String,
    /// Cluster for services, service for components, provider for hosts
    pub parent_id: Option<i64>,
    /// Owning cluster for services/components, attached cluster for hosts
    pub cluster_id: Option<i64>,
    pub state: String,
    pub multi_state: BTreeSet<String>,
    pub config_root_id: Option<i64>,
    pub maintenance_mode: MaintenanceMode,
    pub before_upgrade: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.object_type, self.id)
    }
}

/// New object row prior to insertion
#[derive(Debug, Clone)]
pub struct NewObject {
    pub object_type: ObjectType,
    pub prototype_id: i64,
    pub name: String,
    pub description: String,
    pub parent_id: Option<i64>,
    pub cluster_id: Option<i64>,
    pub config_root_id: Option<i64>,
}

/// One (host, service, component) mapping triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HcEntry {
    pub host_id: i64,
    pub service_id: i64,
    pub component_id: i64,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLogRecord {
    pub id: i64,
    pub root_id: i64,
    pub config: serde_json::Value,
    pub attr: serde_json::Value,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostGroupKind {
    Config,
    Action,
}

impl HostGroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostGroupKind::Config => "config",
            HostGroupKind::Action => "action",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostGroupRecord {
    pub id: i64,
    pub kind: HostGroupKind,
    pub owner: ObjectRef,
    pub name: String,
    pub description: String,
    pub config_root_id: Option<i64>,
    pub hosts: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindRecord {
    pub id: i64,
    pub cluster_id: i64,
    pub service_id: Option<i64>,
    pub source: ObjectRef,
}

// ============================================================================
// Concerns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcernType {
    Lock,
    Issue,
    Flag,
}

impl ConcernType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcernType::Lock => "lock",
            ConcernType::Issue => "issue",
            ConcernType::Flag => "flag",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "lock" => Ok(ConcernType::Lock),
            "issue" => Ok(ConcernType::Issue),
            "flag" => Ok(ConcernType::Flag),
            other => Err(anyhow::anyhow!("Unknown concern type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcernCause {
    Config,
    Import,
    Service,
    HostComponent,
    Requirement,
}

impl ConcernCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcernCause::Config => "config",
            ConcernCause::Import => "import",
            ConcernCause::Service => "service",
            ConcernCause::HostComponent => "hostcomponent",
            ConcernCause::Requirement => "requirement",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "config" => Ok(ConcernCause::Config),
            "import" => Ok(ConcernCause::Import),
            "service" => Ok(ConcernCause::Service),
            "hostcomponent" => Ok(ConcernCause::HostComponent),
            "requirement" => Ok(ConcernCause::Requirement),
            other => Err(anyhow::anyhow!("Unknown concern cause: {}", other)),
        }
    }
}

/// Object descriptor used to fill a reason placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderObject {
    #[serde(rename = "type")]
    pub object_type: String,
    pub name: String,
    pub params: BTreeMap<String, i64>,
}

/// Parametric message with `${source}`, `${target}`, `${job}` placeholders
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConcernReason {
    pub message: String,
    pub placeholder: BTreeMap<String, PlaceholderObject>,
}

impl ConcernReason {
    /// Message with every placeholder replaced by its object name
    pub fn render(&self) -> String {
        let mut text = self.message.clone();
        for (key, object) in &self.placeholder {
            text = text.replace(&format!("${{{}}}", key), &object.name);
        }
        text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcernRecord {
    pub id: i64,
    pub concern_type: ConcernType,
    pub cause: Option<ConcernCause>,
    pub name: String,
    pub owner: ObjectRef,
    pub blocking: bool,
    pub reason: ConcernReason,
    pub task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConcern {
    pub concern_type: ConcernType,
    pub cause: Option<ConcernCause>,
    pub name: String,
    pub owner: ObjectRef,
    pub blocking: bool,
    pub reason: ConcernReason,
    pub task_id: Option<i64>,
}

// ============================================================================
// Tasks and jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Scheduled,
    Queued,
    Running,
    Success,
    Failed,
    Aborted,
    Broken,
    Revoked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Broken => "broken",
            TaskStatus::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "created" => Ok(TaskStatus::Created),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "aborted" => Ok(TaskStatus::Aborted),
            "broken" => Ok(TaskStatus::Broken),
            "revoked" => Ok(TaskStatus::Revoked),
            other => Err(anyhow::anyhow!("Unknown task status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::Failed
                | TaskStatus::Aborted
                | TaskStatus::Broken
                | TaskStatus::Revoked
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(anyhow::anyhow!("Unknown job status: {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// What an action runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTarget {
    Object(ObjectRef),
    ActionHostGroup { group_id: i64 },
}

/// Mapping snapshot captured at task creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HcDelta {
    pub current: Vec<HcEntry>,
    pub add: Vec<HcEntry>,
    pub remove: Vec<HcEntry>,
}

impl HcDelta {
    pub fn between(current: &BTreeSet<HcEntry>, desired: &BTreeSet<HcEntry>) -> Self {
        Self {
            current: current.iter().copied().collect(),
            add: desired.difference(current).copied().collect(),
            remove: current.difference(desired).copied().collect(),
        }
    }

    pub fn desired(&self) -> BTreeSet<HcEntry> {
        let remove: BTreeSet<HcEntry> = self.remove.iter().copied().collect();
        self.current
            .iter()
            .filter(|e| !remove.contains(e))
            .chain(self.add.iter())
            .copied()
            .collect()
    }

    pub fn remain(&self) -> Vec<HcEntry> {
        let remove: BTreeSet<HcEntry> = self.remove.iter().copied().collect();
        self.current
            .iter()
            .filter(|e| !remove.contains(e))
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorDescriptor {
    pub worker_id: String,
    pub environment: ExecutionEnvironment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorEntry {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub action_id: i64,
    /// Object the action runs on; gates and effects apply here
    pub object: ObjectRef,
    pub target: TaskTarget,
    pub config: Option<serde_json::Value>,
    pub attr: serde_json::Value,
    pub verbose: bool,
    pub hostcomponent: Option<HcDelta>,
    pub status: TaskStatus,
    pub executor: Option<ExecutorDescriptor>,
    pub selector: BTreeMap<String, SelectorEntry>,
    pub owner_user: String,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub action_id: i64,
    pub object: ObjectRef,
    pub target: TaskTarget,
    pub config: Option<serde_json::Value>,
    pub attr: serde_json::Value,
    pub verbose: bool,
    pub hostcomponent: Option<HcDelta>,
    pub selector: BTreeMap<String, SelectorEntry>,
    pub owner_user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub task_id: i64,
    pub position: i64,
    pub name: String,
    pub spec: SubactionSpec,
    pub status: JobStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub log_dir: Option<String>,
    /// Bearer token for plugin callbacks from this job
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stdout,
    Stderr,
    Check,
    Custom,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Stdout => "stdout",
            LogType::Stderr => "stderr",
            LogType::Check => "check",
            LogType::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "stdout" => Ok(LogType::Stdout),
            "stderr" => Ok(LogType::Stderr),
            "check" => Ok(LogType::Check),
            "custom" => Ok(LogType::Custom),
            other => Err(anyhow::anyhow!("Unknown log type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Txt,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Txt => "txt",
            LogFormat::Json => "json",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "txt" => Ok(LogFormat::Txt),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("Unknown log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    pub log_type: LogType,
    pub format: LogFormat,
    pub body: Option<String>,
    pub file: Option<String>,
}

/// Log entry produced by an executor before persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLog {
    pub name: String,
    pub log_type: LogType,
    pub format: LogFormat,
    pub body: Option<String>,
    pub file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintenance_mode_ordering() {
        assert!(MaintenanceMode::Off < MaintenanceMode::Changing);
        assert!(MaintenanceMode::Changing < MaintenanceMode::On);
        assert_eq!(
            MaintenanceMode::Off.max(MaintenanceMode::On),
            MaintenanceMode::On
        );
    }

    #[test]
    fn test_hc_delta() {
        let e = |h, c| HcEntry {
            host_id: h,
            service_id: 1,
            component_id: c,
        };
        let current: BTreeSet<_> = [e(1, 10), e(2, 10)].into_iter().collect();
        let desired: BTreeSet<_> = [e(1, 10), e(3, 10)].into_iter().collect();

        let delta = HcDelta::between(&current, &desired);
        assert_eq!(delta.add, vec![e(3, 10)]);
        assert_eq!(delta.remove, vec![e(2, 10)]);
        assert_eq!(delta.remain(), vec![e(1, 10)]);
        assert_eq!(delta.desired(), desired);
    }

    #[test]
    fn test_reason_render() {
        let mut placeholder = BTreeMap::new();
        placeholder.insert(
            "source".to_string(),
            PlaceholderObject {
                object_type: "service".into(),
                name: "svc".into(),
                params: BTreeMap::from([("service_id".to_string(), 4)]),
            },
        );
        let reason = ConcernReason {
            message: "${source} has an issue with its config".into(),
            placeholder,
        };
        assert_eq!(reason.render(), "svc has an issue with its config");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Revoked.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert_eq!(TaskStatus::parse("broken").unwrap(), TaskStatus::Broken);
    }
}
