//! `scripts_jinja` / `config_jinja` rendering.
//!
//! Templates are YAML files with Jinja markup, stored in the unpacked bundle.
//! The render context is `{cluster, services, groups, task, action}`.

use anyhow::Result;
use minijinja::Environment;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

use crate::catalog::definition::{PrototypeType, SubactionSpec};
use crate::errors::ConductorError;
use crate::params::schema::ConfigDefinition;

fn generator_error(reason: String) -> ConductorError {
    ConductorError::TaskGenerator { reason }
}

/// Resolve a bundle-relative template path; escaping the bundle is refused
pub fn template_path(bundle_dir: &Path, template: &str) -> Result<PathBuf, ConductorError> {
    let relative = Path::new(template.trim_start_matches("./"));
    let escapes = relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(generator_error(format!(
            "template path '{}' points outside the bundle",
            template
        )));
    }
    Ok(bundle_dir.join(relative))
}

pub async fn read_template(bundle_dir: &Path, template: &str) -> Result<String> {
    let path = template_path(bundle_dir, template)?;
    tokio::fs::read_to_string(&path).await.map_err(|e| {
        generator_error(format!("cannot read template {}: {}", path.display(), e)).into()
    })
}

fn render(source: &str, context: &Value) -> Result<String, ConductorError> {
    let env = Environment::new();
    env.render_str(source, context)
        .map_err(|e| generator_error(format!("template render failed: {}", e)))
}

/// Ordered subactions produced by a `scripts_jinja` template
pub fn render_scripts(source: &str, context: &Value) -> Result<Vec<SubactionSpec>, ConductorError> {
    let rendered = render(source, context)?;
    let scripts: Option<Vec<SubactionSpec>> = serde_yaml::from_str(&rendered)
        .map_err(|e| generator_error(format!("rendered scripts are not valid: {}", e)))?;
    let scripts = scripts.unwrap_or_default();
    if scripts.is_empty() {
        return Err(generator_error("template produced no scripts".to_string()));
    }
    Ok(scripts)
}

/// Per-run config schema produced by a `config_jinja` template
pub fn render_config(source: &str, context: &Value) -> Result<ConfigDefinition, ConductorError> {
    let rendered = render(source, context)?;
    let schema: Option<ConfigDefinition> = serde_yaml::from_str(&rendered)
        .map_err(|e| generator_error(format!("rendered config is not valid: {}", e)))?;
    Ok(schema.unwrap_or_default())
}

/// Inventory group an action's owner maps to
pub fn owner_group(
    prototype_type: PrototypeType,
    service_name: Option<&str>,
    component_name: Option<&str>,
) -> String {
    match (prototype_type, service_name, component_name) {
        (PrototypeType::Component, Some(service), Some(component)) => {
            format!("{}.{}", service, component)
        }
        (PrototypeType::Service, Some(service), _) => service.to_string(),
        (PrototypeType::Provider, _, _) => "PROVIDER".to_string(),
        (PrototypeType::Host, _, _) => "HOST".to_string(),
        _ => "CLUSTER".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::definition::ScriptType;
    use serde_json::json;
    use tempfile::TempDir;

    const SCRIPTS: &str = r#"
- name: prepare
  script: prepare.yaml
  script_type: ansible
{% if groups['db.master.add'] is defined %}
- name: expand
  script: expand.yaml
  script_type: ansible
  state_on_fail: broken
{% endif %}
{% if task.verbose %}
- name: debug
  script: debug.yaml
  script_type: ansible
{% endif %}
"#;

    fn context(groups: Value, verbose: bool) -> Value {
        json!({
            "cluster": {"name": "Test"},
            "services": {},
            "groups": groups,
            "task": {"config": null, "verbose": verbose},
            "action": {"owner_group": "CLUSTER", "name": "expand"}
        })
    }

    #[test]
    fn test_scripts_follow_context() {
        let scripts = render_scripts(SCRIPTS, &context(json!({}), false)).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "prepare");
        assert_eq!(scripts[0].script_type, ScriptType::Ansible);

        let scripts =
            render_scripts(SCRIPTS, &context(json!({"db.master.add": ["h2"]}), true)).unwrap();
        let names: Vec<_> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["prepare", "expand", "debug"]);
        assert_eq!(scripts[1].state_on_fail.as_deref(), Some("broken"));
    }

    #[test]
    fn test_empty_render_is_an_error() {
        let err = render_scripts("{% if false %}- x{% endif %}", &context(json!({}), false)).unwrap_err();
        assert_eq!(err.code(), "TASK_GENERATOR_ERROR");
    }

    #[test]
    fn test_syntax_error() {
        let err = render_scripts("{% if %}", &context(json!({}), false)).unwrap_err();
        assert_eq!(err.code(), "TASK_GENERATOR_ERROR");
    }

    #[test]
    fn test_render_config() {
        let source = r#"
- name: nodes
  type: integer
  default: {{ groups['CLUSTER'] | length }}
"#;
        let schema = render_config(source, &context(json!({"CLUSTER": ["h1", "h2"]}), false)).unwrap();
        assert_eq!(schema.fields.len(), 1);
        assert_eq!(schema.fields[0].default, Some(json!(2)));
    }

    #[test]
    fn test_template_path_stays_in_bundle() {
        let dir = Path::new("/stack/bundle/abc");
        assert_eq!(
            template_path(dir, "./jinja/scripts.j2").unwrap(),
            dir.join("jinja/scripts.j2")
        );
        assert!(template_path(dir, "../other/x.j2").is_err());
        assert!(template_path(dir, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_read_template() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("s.j2"), "- name: a").unwrap();
        assert_eq!(read_template(dir.path(), "s.j2").await.unwrap(), "- name: a");
        let err = read_template(dir.path(), "missing.j2").await.unwrap_err();
        assert!(err.to_string().contains("TASK_GENERATOR_ERROR"));
    }

    #[test]
    fn test_owner_group() {
        assert_eq!(owner_group(PrototypeType::Component, Some("db"), Some("master")), "db.master");
        assert_eq!(owner_group(PrototypeType::Service, Some("db"), None), "db");
        assert_eq!(owner_group(PrototypeType::Cluster, None, None), "CLUSTER");
        assert_eq!(owner_group(PrototypeType::Host, None, None), "HOST");
    }
}
