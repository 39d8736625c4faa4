//! Typed parameter tree schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::catalog::definition::StateGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Password,
    Text,
    Secrettext,
    Integer,
    Float,
    Boolean,
    Option,
    Variant,
    List,
    Map,
    Secretmap,
    File,
    Secretfile,
    Json,
    Group,
}

impl FieldType {
    /// Values that never leave the engine in plaintext
    pub fn is_secret(&self) -> bool {
        matches!(
            self,
            FieldType::Password | FieldType::Secrettext | FieldType::Secretmap | FieldType::Secretfile
        )
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FieldType::File | FieldType::Secretfile)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Label to allowed value, for `option` fields
    #[serde(default)]
    pub option: Option<BTreeMap<String, Value>>,
    /// Allowed values for `variant` fields
    #[serde(default)]
    pub source: Option<Vec<String>>,
    /// Variant values outside `source` are rejected when strict
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub read_only: Option<StateGate>,
    #[serde(default)]
    pub writable: Option<StateGate>,
    /// Groups only: carries an `active` flag in the attr tree
    #[serde(default)]
    pub activatable: bool,
    /// Initial `active` value of an activatable group
    #[serde(default)]
    pub active: bool,
    /// Per-field override of the prototype's `config_group_customization`
    #[serde(default)]
    pub group_customization: Option<bool>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub subs: Vec<FieldSpec>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    /// Whether the field may be changed while the owner is in `state`
    pub fn is_writable_in(&self, state: &str) -> bool {
        if let Some(read_only) = &self.read_only {
            return !read_only.contains(state);
        }
        if let Some(writable) = &self.writable {
            return writable.contains(state);
        }
        true
    }

    pub fn allows_group_customization(&self, prototype_default: bool) -> bool {
        self.group_customization.unwrap_or(prototype_default)
    }
}

/// Leaf with its position in the tree
#[derive(Debug, Clone, Copy)]
pub struct LeafRef<'a> {
    pub group: Option<&'a FieldSpec>,
    pub field: &'a FieldSpec,
}

impl LeafRef<'_> {
    /// Dotted path, `group.leaf` or `leaf`
    pub fn path(&self) -> String {
        match self.group {
            Some(group) => format!("{}.{}", group.name, self.field.name),
            None => self.field.name.clone(),
        }
    }

    pub fn get<'v>(&self, config: &'v Value) -> Option<&'v Value> {
        match self.group {
            Some(group) => config.get(&group.name)?.get(&self.field.name),
            None => config.get(&self.field.name),
        }
    }

    pub fn set(&self, config: &mut Value, value: Value) {
        if !config.is_object() {
            *config = Value::Object(Map::new());
        }
        let Some(root) = config.as_object_mut() else {
            return;
        };
        match self.group {
            Some(group) => {
                let entry = root
                    .entry(group.name.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Some(group_map) = entry.as_object_mut() {
                    group_map.insert(self.field.name.clone(), value);
                }
            }
            None => {
                root.insert(self.field.name.clone(), value);
            }
        }
    }
}

/// Ordered list of top-level fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDefinition {
    pub fields: Vec<FieldSpec>,
}

impl ConfigDefinition {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All leaves, groups expanded
    pub fn leaves(&self) -> Vec<LeafRef<'_>> {
        let mut leaves = Vec::new();
        for field in &self.fields {
            if field.field_type == FieldType::Group {
                for sub in &field.subs {
                    leaves.push(LeafRef {
                        group: Some(field),
                        field: sub,
                    });
                }
            } else {
                leaves.push(LeafRef { group: None, field });
            }
        }
        leaves
    }

    pub fn leaf(&self, path: &str) -> Option<LeafRef<'_>> {
        self.leaves().into_iter().find(|leaf| leaf.path() == path)
    }

    pub fn activatable_groups(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::Group && f.activatable)
    }

    /// Config and attr trees built from schema defaults
    pub fn defaults(&self) -> (Value, Value) {
        let mut config = Map::new();
        let mut attr = Map::new();

        for field in &self.fields {
            if field.field_type == FieldType::Group {
                let mut group = Map::new();
                for sub in &field.subs {
                    group.insert(sub.name.clone(), sub.default.clone().unwrap_or(Value::Null));
                }
                config.insert(field.name.clone(), Value::Object(group));
                if field.activatable {
                    attr.insert(
                        field.name.clone(),
                        serde_json::json!({ "active": field.active }),
                    );
                }
            } else {
                config.insert(
                    field.name.clone(),
                    field.default.clone().unwrap_or(Value::Null),
                );
            }
        }

        (Value::Object(config), Value::Object(attr))
    }

    /// `active` flag of an activatable group (non-activatable groups are always active)
    pub fn group_is_active(&self, group: &FieldSpec, attr: &Value) -> bool {
        if !group.activatable {
            return true;
        }
        attr.get(&group.name)
            .and_then(|a| a.get("active"))
            .and_then(Value::as_bool)
            .unwrap_or(group.active)
    }
}
