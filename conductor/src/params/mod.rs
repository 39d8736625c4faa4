//! Config engine: typed parameter trees stored as append-only ConfigLogs.

pub mod crypto;
pub mod files;
pub mod schema;
pub mod validate;

use anyhow::Result;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::catalog::Catalog;
use crate::database::{ConfigLogRecord, Database, HostGroupKind, HostGroupRecord, ObjectRecord, ObjectRef};
use crate::errors::ConductorError;
use files::FileScope;
use schema::ConfigDefinition;

pub use crypto::SecretCipher;
pub use files::FileStore;

pub struct ConfigService {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    cipher: Arc<SecretCipher>,
    files: FileStore,
}

impl ConfigService {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        cipher: Arc<SecretCipher>,
        files: FileStore,
    ) -> Self {
        Self {
            db,
            catalog,
            cipher,
            files,
        }
    }

    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Schema declared by the object's prototype
    pub async fn schema_for(&self, object: &ObjectRecord) -> Result<ConfigDefinition> {
        Ok(self
            .catalog
            .prototype(object.prototype_id)
            .await?
            .spec
            .config
            .clone()
            .unwrap_or_default())
    }

    /// First ConfigLog of a new object, built from schema defaults.
    /// Objects without a schema get no config root.
    pub async fn init_config(&self, owner: ObjectRef, schema: &ConfigDefinition) -> Result<Option<i64>> {
        if schema.is_empty() {
            return Ok(None);
        }
        let (mut config, attr) = schema.defaults();
        self.cipher.seal(schema, &mut config)?;
        let (root_id, _) = self.db.create_config_root(&config, &attr, "init").await?;
        self.files
            .write_leaves(&FileScope::object(owner), schema, &config)
            .await?;
        Ok(Some(root_id))
    }

    async fn owner_root(&self, owner: ObjectRef) -> Result<(ObjectRecord, i64)> {
        let object = self.db.require_object(owner).await?;
        let root_id = object.config_root_id.ok_or_else(|| ConductorError::ConfigNotFound {
            object: owner.to_string(),
        })?;
        Ok((object, root_id))
    }

    async fn current_log(&self, root_id: i64, label: &str) -> Result<ConfigLogRecord> {
        self.db.current_config_log(root_id).await?.ok_or_else(|| {
            ConductorError::ConfigNotFound {
                object: label.to_string(),
            }
            .into()
        })
    }

    /// Current ConfigLog of an object
    pub async fn get_config(&self, owner: ObjectRef) -> Result<ConfigLogRecord> {
        let (_, root_id) = self.owner_root(owner).await?;
        self.current_log(root_id, &owner.to_string()).await
    }

    pub async fn list_config_versions(&self, owner: ObjectRef) -> Result<Vec<ConfigLogRecord>> {
        let (_, root_id) = self.owner_root(owner).await?;
        self.db.list_config_logs(root_id).await
    }

    /// Validate `values` over the current config and append a new ConfigLog
    #[instrument(skip(self, values, attr))]
    pub async fn put_config(
        &self,
        owner: ObjectRef,
        values: &Value,
        attr: Option<&Value>,
        description: &str,
    ) -> Result<ConfigLogRecord> {
        let (object, root_id) = self.owner_root(owner).await?;
        let schema = self.schema_for(&object).await?;
        let current = self.current_log(root_id, &owner.to_string()).await?;

        let mut config = validate::merge(&current.config, values);
        let attr = match attr {
            Some(attr) => validate::merge(&current.attr, attr),
            None => current.attr.clone(),
        };

        validate::check_structure(&schema, &config)?;
        validate::check_attr(&schema, &attr)?;
        self.cipher.seal(&schema, &mut config)?;
        validate::check_writable(&schema, &current.config, &config, &object.state)?;

        let log = self
            .db
            .append_config_log(root_id, &config, &attr, description)
            .await?;
        self.files
            .write_leaves(&FileScope::object(owner), &schema, &config)
            .await?;
        info!("Config of {} advanced to #{}", owner, log.id);
        Ok(log)
    }

    /// Copy an earlier ConfigLog of the same object into a new current row
    #[instrument(skip(self))]
    pub async fn restore_config(&self, owner: ObjectRef, log_id: i64) -> Result<ConfigLogRecord> {
        let (object, root_id) = self.owner_root(owner).await?;
        let source = self
            .db
            .get_config_log(log_id)
            .await?
            .filter(|log| log.root_id == root_id)
            .ok_or_else(|| ConductorError::ConfigNotFound {
                object: format!("config version #{} of {}", log_id, owner),
            })?;

        let schema = self.schema_for(&object).await?;
        let current = self.current_log(root_id, &owner.to_string()).await?;
        validate::check_writable(&schema, &current.config, &source.config, &object.state)?;

        let description = format!("restored from #{}", log_id);
        let log = self
            .db
            .append_config_log(root_id, &source.config, &source.attr, &description)
            .await?;
        self.files
            .write_leaves(&FileScope::object(owner), &schema, &log.config)
            .await?;
        Ok(log)
    }

    /// Base config, overlaid with config host group values when `host` is
    /// a member of one of the owner's groups. Secrets stay sealed.
    pub async fn get_effective_config(&self, owner: ObjectRef, host: Option<i64>) -> Result<Value> {
        let (object, root_id) = self.owner_root(owner).await?;
        let base = self.current_log(root_id, &owner.to_string()).await?;
        let Some(host_id) = host else {
            return Ok(base.config);
        };

        let schema = self.schema_for(&object).await?;
        let mut config = base.config;
        for group in self.db.list_config_groups_for_host(host_id).await? {
            if group.owner != owner {
                continue;
            }
            let Some(group_root) = group.config_root_id else {
                continue;
            };
            let group_log = self.current_log(group_root, &group.name).await?;
            apply_group_overrides(&schema, &mut config, &group_log);
        }
        Ok(config)
    }

    /// Required leaves missing a value in the current config
    pub async fn validate_completeness(&self, owner: ObjectRef) -> Result<Vec<String>> {
        let object = self.db.require_object(owner).await?;
        let Some(root_id) = object.config_root_id else {
            return Ok(Vec::new());
        };
        let schema = self.schema_for(&object).await?;
        let current = self.current_log(root_id, &owner.to_string()).await?;
        Ok(validate::completeness_violations(
            &schema,
            &current.config,
            &current.attr,
        ))
    }

    /// Plaintext copy of a config tree, for job preparation only
    pub fn unsealed(&self, schema: &ConfigDefinition, config: &Value) -> Result<Value> {
        let mut plain = config.clone();
        self.cipher.unseal(schema, &mut plain)?;
        Ok(plain)
    }

    /// Per-run action config: payload merged over schema defaults, checked
    /// for structure and completeness. Returns (config, attr).
    pub fn build_action_config(
        &self,
        schema: &ConfigDefinition,
        values: Option<&Value>,
        attr: Option<&Value>,
    ) -> Result<(Value, Value)> {
        let (defaults, default_attr) = schema.defaults();
        let config = match values {
            Some(values) => validate::merge(&defaults, values),
            None => defaults,
        };
        let attr = match attr {
            Some(attr) => validate::merge(&default_attr, attr),
            None => default_attr,
        };

        validate::check_structure(schema, &config)?;
        validate::check_attr(schema, &attr)?;
        if let Some(key) = validate::completeness_violations(schema, &config, &attr)
            .into_iter()
            .next()
        {
            return Err(ConductorError::ConfigValue {
                key,
                reason: "value is required".to_string(),
            }
            .into());
        }

        let mut config = config;
        self.cipher.seal(schema, &mut config)?;
        Ok((config, attr))
    }

    /// Move an object's config onto the schema of `new_prototype_id`.
    ///
    /// Leaves present in both schemas keep their value; new leaves get their
    /// defaults. Returns the id of the ConfigLog that was current before.
    #[instrument(skip(self))]
    pub async fn migrate_config(&self, owner: ObjectRef, new_prototype_id: i64) -> Result<Option<i64>> {
        let object = self.db.require_object(owner).await?;
        let old_schema = self.schema_for(&object).await?;
        let new_schema = self
            .catalog
            .prototype(new_prototype_id)
            .await?
            .spec
            .config
            .clone()
            .unwrap_or_default();

        let previous = match object.config_root_id {
            Some(root_id) => Some(self.current_log(root_id, &owner.to_string()).await?),
            None => None,
        };
        if new_schema.is_empty() {
            return Ok(previous.map(|log| log.id));
        }

        let (mut config, mut attr) = new_schema.defaults();
        if let Some(previous) = &previous {
            for leaf in new_schema.leaves() {
                let path = leaf.path();
                if old_schema.leaf(&path).is_none() {
                    continue;
                }
                if let Some(value) = leaf.get(&previous.config).filter(|v| !v.is_null()) {
                    leaf.set(&mut config, value.clone());
                }
            }
            for group in new_schema.activatable_groups() {
                if let Some(old_attr) = previous.attr.get(&group.name) {
                    if let Some(map) = attr.as_object_mut() {
                        map.insert(group.name.clone(), old_attr.clone());
                    }
                }
            }
        }
        self.cipher.seal(&new_schema, &mut config)?;

        match object.config_root_id {
            Some(root_id) => {
                self.db
                    .append_config_log(root_id, &config, &attr, "upgrade")
                    .await?;
            }
            None => {
                let (root_id, _) = self.db.create_config_root(&config, &attr, "upgrade").await?;
                self.db.set_config_root(owner, root_id).await?;
            }
        }
        self.files
            .write_leaves(&FileScope::object(owner), &new_schema, &config)
            .await?;
        Ok(previous.map(|log| log.id))
    }

    /// Re-append an earlier ConfigLog without writability checks (bundle revert).
    /// Returns false when that log no longer exists.
    pub async fn reinstate_config(&self, owner: ObjectRef, log_id: i64) -> Result<bool> {
        let (object, root_id) = self.owner_root(owner).await?;
        let Some(source) = self.db.get_config_log(log_id).await?.filter(|l| l.root_id == root_id) else {
            warn!(
                "Config log #{} of {} is gone, keeping the current config",
                log_id, owner
            );
            return Ok(false);
        };
        let schema = self.schema_for(&object).await?;
        self.db
            .append_config_log(root_id, &source.config, &source.attr, "revert")
            .await?;
        self.files
            .write_leaves(&FileScope::object(owner), &schema, &source.config)
            .await?;
        Ok(true)
    }

    // ========================================================================
    // Config host groups
    // ========================================================================

    /// Config root of a new config host group: a copy of the owner's current
    /// config with nothing overridden yet
    pub async fn init_group_config(&self, owner: ObjectRef) -> Result<i64> {
        let (object, root_id) = self.owner_root(owner).await?;
        let schema = self.schema_for(&object).await?;
        let current = self.current_log(root_id, &owner.to_string()).await?;

        let mut attr = validate::object_or_empty(Some(&current.attr));
        if let Some(map) = attr.as_object_mut() {
            map.insert("group_keys".to_string(), empty_group_keys(&schema));
        }
        let (group_root, _) = self
            .db
            .create_config_root(&current.config, &attr, "group init")
            .await?;
        Ok(group_root)
    }

    /// Store a config host group's own ConfigLog. Only leaves whose schema
    /// allows group customization may be flagged in `attr.group_keys`.
    #[instrument(skip(self, values, attr))]
    pub async fn put_group_config(
        &self,
        group_id: i64,
        values: &Value,
        attr: &Value,
    ) -> Result<ConfigLogRecord> {
        let group = self.require_config_group(group_id).await?;
        let owner = self.db.require_object(group.owner).await?;
        let prototype = self.catalog.prototype(owner.prototype_id).await?;
        let schema = prototype.spec.config.clone().unwrap_or_default();
        let group_root = group.config_root_id.ok_or_else(|| ConductorError::ConfigNotFound {
            object: format!("config group {}", group.name),
        })?;
        let current = self.current_log(group_root, &group.name).await?;

        let group_keys = attr
            .get("group_keys")
            .cloned()
            .unwrap_or_else(|| current.attr.get("group_keys").cloned().unwrap_or(Value::Null));
        for path in validate::overridden_leaves(&schema, &group_keys) {
            let allowed = schema.leaf(&path).is_some_and(|leaf| {
                leaf.field
                    .allows_group_customization(prototype.spec.config_group_customization)
            });
            if !allowed {
                return Err(ConductorError::ConfigKey {
                    key: path,
                    reason: "cannot be customized in a config group".to_string(),
                }
                .into());
            }
        }

        let mut config = validate::merge(&current.config, values);
        validate::check_structure(&schema, &config)?;
        self.cipher.seal(&schema, &mut config)?;

        let mut attr = validate::merge(&current.attr, attr);
        if let Some(map) = attr.as_object_mut() {
            map.insert("group_keys".to_string(), group_keys);
        }
        let log = self
            .db
            .append_config_log(group_root, &config, &attr, "group config")
            .await?;
        self.files
            .write_leaves(&FileScope::host_group(group.owner, group.id), &schema, &config)
            .await?;
        debug!("Config group {} advanced to #{}", group.name, log.id);
        Ok(log)
    }

    async fn require_config_group(&self, group_id: i64) -> Result<HostGroupRecord> {
        self.db
            .get_host_group(group_id)
            .await?
            .filter(|g| g.kind == HostGroupKind::Config)
            .ok_or_else(|| {
                ConductorError::ObjectNotFound {
                    object: format!("config group #{}", group_id),
                }
                .into()
            })
    }
}

/// `group_keys` tree with every leaf set to false
fn empty_group_keys(schema: &ConfigDefinition) -> Value {
    let mut keys = Map::new();
    for field in &schema.fields {
        if field.subs.is_empty() {
            keys.insert(field.name.clone(), json!(false));
        } else {
            let subs: Map<String, Value> = field
                .subs
                .iter()
                .map(|s| (s.name.clone(), json!(false)))
                .collect();
            keys.insert(field.name.clone(), Value::Object(subs));
        }
    }
    Value::Object(keys)
}

/// Shallow per-leaf overlay of a group's flagged leaves
pub fn apply_group_overrides(schema: &ConfigDefinition, config: &mut Value, group_log: &ConfigLogRecord) {
    let group_keys = group_log.attr.get("group_keys").cloned().unwrap_or(Value::Null);
    for path in validate::overridden_leaves(schema, &group_keys) {
        if let Some(leaf) = schema.leaf(&path) {
            let value = leaf.get(&group_log.config).cloned().unwrap_or(Value::Null);
            leaf.set(config, value);
        }
    }
}
