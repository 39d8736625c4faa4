//! Config tree validation against a schema.

use serde_json::{Map, Value};

use super::schema::{ConfigDefinition, FieldSpec, FieldType, LeafRef};
use crate::errors::ConductorError;

/// Overlay `values` onto `base`; keys absent from `values` keep their base value
pub fn merge(base: &Value, values: &Value) -> Value {
    match (base, values) {
        (Value::Object(base_map), Value::Object(value_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in value_map {
                let next = match (base_map.get(key), value) {
                    (Some(Value::Object(_)), Value::Object(_)) => {
                        merge(&base_map[key.as_str()], value)
                    }
                    _ => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

/// Structural and type checks. Null leaves are accepted here; required
/// values are reported by [`completeness_violations`].
pub fn check_structure(schema: &ConfigDefinition, config: &Value) -> Result<(), ConductorError> {
    let Some(root) = config.as_object() else {
        return Err(ConductorError::ConfigValue {
            key: "<root>".to_string(),
            reason: "config must be an object".to_string(),
        });
    };

    for key in root.keys() {
        if schema.field(key).is_none() {
            return Err(ConductorError::ConfigKey {
                key: key.clone(),
                reason: "not declared in the schema".to_string(),
            });
        }
    }

    for field in &schema.fields {
        if field.field_type != FieldType::Group {
            continue;
        }
        match root.get(&field.name) {
            None | Some(Value::Null) => {}
            Some(Value::Object(group)) => {
                for key in group.keys() {
                    if !field.subs.iter().any(|s| &s.name == key) {
                        return Err(ConductorError::ConfigKey {
                            key: format!("{}.{}", field.name, key),
                            reason: "not declared in the schema".to_string(),
                        });
                    }
                }
            }
            Some(_) => {
                return Err(ConductorError::ConfigValue {
                    key: field.name.clone(),
                    reason: "group value must be an object".to_string(),
                })
            }
        }
    }

    for leaf in schema.leaves() {
        if let Some(value) = leaf.get(config) {
            check_leaf(&leaf, value)?;
        }
    }
    Ok(())
}

fn value_error(leaf: &LeafRef<'_>, reason: impl Into<String>) -> ConductorError {
    ConductorError::ConfigValue {
        key: leaf.path(),
        reason: reason.into(),
    }
}

fn check_leaf(leaf: &LeafRef<'_>, value: &Value) -> Result<(), ConductorError> {
    if value.is_null() {
        return Ok(());
    }
    let field = leaf.field;
    match field.field_type {
        FieldType::String
        | FieldType::Password
        | FieldType::Text
        | FieldType::Secrettext
        | FieldType::File
        | FieldType::Secretfile => {
            if !value.is_string() {
                return Err(value_error(leaf, "should be a string"));
            }
        }
        FieldType::Integer => {
            let Some(n) = value.as_i64() else {
                return Err(value_error(leaf, "should be an integer"));
            };
            check_range(leaf, field, n as f64)?;
        }
        FieldType::Float => {
            let Some(n) = value.as_f64() else {
                return Err(value_error(leaf, "should be a number"));
            };
            check_range(leaf, field, n)?;
        }
        FieldType::Boolean => {
            if !value.is_boolean() {
                return Err(value_error(leaf, "should be a boolean"));
            }
        }
        FieldType::Option => {
            let allowed = field.limits.option.as_ref();
            if !allowed.is_some_and(|options| options.values().any(|o| o == value)) {
                return Err(value_error(leaf, format!("{} is not one of the options", value)));
            }
        }
        FieldType::Variant => {
            let Some(text) = value.as_str() else {
                return Err(value_error(leaf, "should be a string"));
            };
            if field.limits.strict {
                let known = field
                    .limits
                    .source
                    .as_ref()
                    .is_some_and(|source| source.iter().any(|s| s == text));
                if !known {
                    return Err(value_error(leaf, format!("'{}' is not an allowed value", text)));
                }
            }
        }
        FieldType::List => {
            let Some(items) = value.as_array() else {
                return Err(value_error(leaf, "should be a list"));
            };
            if items.iter().any(|i| !i.is_string()) {
                return Err(value_error(leaf, "list items should be strings"));
            }
        }
        FieldType::Map | FieldType::Secretmap => {
            if !value.is_object() {
                return Err(value_error(leaf, "should be a map"));
            }
        }
        FieldType::Json | FieldType::Group => {}
    }
    Ok(())
}

fn check_range(leaf: &LeafRef<'_>, field: &FieldSpec, n: f64) -> Result<(), ConductorError> {
    if let Some(min) = field.limits.min {
        if n < min {
            return Err(value_error(leaf, format!("should be at least {}", min)));
        }
    }
    if let Some(max) = field.limits.max {
        if n > max {
            return Err(value_error(leaf, format!("should be at most {}", max)));
        }
    }
    Ok(())
}

/// Leaves changed between `current` and `next` that are not writable in `state`
pub fn check_writable(
    schema: &ConfigDefinition,
    current: &Value,
    next: &Value,
    state: &str,
) -> Result<(), ConductorError> {
    for leaf in schema.leaves() {
        let before = leaf.get(current).unwrap_or(&Value::Null);
        let after = leaf.get(next).unwrap_or(&Value::Null);
        if before != after && !leaf.field.is_writable_in(state) {
            return Err(ConductorError::ConfigValue {
                key: leaf.path(),
                reason: format!("is read-only in state '{}'", state),
            });
        }
    }
    Ok(())
}

/// `attr` may only carry `active` flags of activatable groups plus `group_keys`
pub fn check_attr(schema: &ConfigDefinition, attr: &Value) -> Result<(), ConductorError> {
    let Some(root) = attr.as_object() else {
        if attr.is_null() {
            return Ok(());
        }
        return Err(ConductorError::ConfigValue {
            key: "attr".to_string(),
            reason: "attr must be an object".to_string(),
        });
    };
    for (key, value) in root {
        if key == "group_keys" {
            continue;
        }
        let activatable = schema
            .field(key)
            .is_some_and(|f| f.field_type == FieldType::Group && f.activatable);
        if !activatable {
            return Err(ConductorError::ConfigKey {
                key: format!("attr.{}", key),
                reason: "is not an activatable group".to_string(),
            });
        }
        if !value.get("active").is_some_and(Value::is_boolean) {
            return Err(ConductorError::ConfigValue {
                key: format!("attr.{}.active", key),
                reason: "should be a boolean".to_string(),
            });
        }
    }
    Ok(())
}

/// Required leaves without a value, skipping inactive activatable groups
pub fn completeness_violations(schema: &ConfigDefinition, config: &Value, attr: &Value) -> Vec<String> {
    let mut missing = Vec::new();
    for leaf in schema.leaves() {
        if !leaf.field.required {
            continue;
        }
        if let Some(group) = leaf.group {
            if !schema.group_is_active(group, attr) {
                continue;
            }
        }
        if is_empty_value(leaf.get(config)) {
            missing.push(leaf.path());
        }
    }
    missing
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Keep only leaves flagged in a `group_keys` tree
pub fn overridden_leaves(schema: &ConfigDefinition, group_keys: &Value) -> Vec<String> {
    schema
        .leaves()
        .into_iter()
        .filter(|leaf| {
            let flag = match leaf.group {
                Some(group) => group_keys.get(&group.name).and_then(|g| g.get(&leaf.field.name)),
                None => group_keys.get(&leaf.field.name),
            };
            flag.and_then(Value::as_bool).unwrap_or(false)
        })
        .map(|leaf| leaf.path())
        .collect()
}

/// Empty object for an absent tree
pub fn object_or_empty(value: Option<&Value>) -> Value {
    match value {
        Some(v @ Value::Object(_)) => v.clone(),
        _ => Value::Object(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::definition::StateGate;
    use serde_json::json;

    fn schema() -> ConfigDefinition {
        serde_json::from_value(json!([
            {"name": "port", "type": "integer", "default": 80, "limits": {"min": 1, "max": 65535}},
            {"name": "mode", "type": "option", "limits": {"option": {"fast": "f", "slow": "s"}}, "required": false},
            {"name": "ssl", "type": "group", "activatable": true, "subs": [
                {"name": "cert", "type": "file"}
            ]}
        ]))
        .unwrap()
    }

    #[test]
    fn test_merge_keeps_unspecified_keys() {
        let base = json!({"port": 80, "ssl": {"cert": "a"}});
        let merged = merge(&base, &json!({"ssl": {"cert": "b"}}));
        assert_eq!(merged, json!({"port": 80, "ssl": {"cert": "b"}}));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = check_structure(&schema(), &json!({"nope": 1})).unwrap_err();
        assert_eq!(err.code(), "CONFIG_KEY_ERROR");
    }

    #[test]
    fn test_type_and_limits() {
        let schema = schema();
        assert!(check_structure(&schema, &json!({"port": 443})).is_ok());
        assert_eq!(
            check_structure(&schema, &json!({"port": 0})).unwrap_err().code(),
            "CONFIG_VALUE_ERROR"
        );
        assert!(check_structure(&schema, &json!({"port": "x"})).is_err());
        assert!(check_structure(&schema, &json!({"mode": "f"})).is_ok());
        assert!(check_structure(&schema, &json!({"mode": "medium"})).is_err());
    }

    #[test]
    fn test_completeness_skips_inactive_groups() {
        let schema = schema();
        let config = json!({"port": 80, "mode": null, "ssl": {"cert": null}});
        assert!(completeness_violations(&schema, &config, &json!({"ssl": {"active": false}})).is_empty());
        assert_eq!(
            completeness_violations(&schema, &config, &json!({"ssl": {"active": true}})),
            vec!["ssl.cert".to_string()]
        );
    }

    #[test]
    fn test_read_only_in_state() {
        let mut schema = schema();
        schema.fields[0].read_only = Some(StateGate::List(vec!["installed".into()]));
        let current = json!({"port": 80});
        assert!(check_writable(&schema, &current, &json!({"port": 81}), "created").is_ok());
        assert!(check_writable(&schema, &current, &json!({"port": 81}), "installed").is_err());
        assert!(check_writable(&schema, &current, &json!({"port": 80}), "installed").is_ok());
    }

    #[test]
    fn test_attr_only_for_activatable_groups() {
        let schema = schema();
        assert!(check_attr(&schema, &json!({"ssl": {"active": true}})).is_ok());
        assert!(check_attr(&schema, &json!({"port": {"active": true}})).is_err());
    }
}
