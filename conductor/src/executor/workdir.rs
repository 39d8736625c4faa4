//! Job work dir: `config.json`, `inventory.json`, secret files and logs.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::PreparedJob;
use crate::catalog::definition::{ScriptType, SubactionSpec};
use crate::catalog::Catalog;
use crate::config::{Config, ExecutorConfig};
use crate::constants::jobs::{CONFIG_FILE, CUSTOM_LOG_PATTERN, INVENTORY_FILE, SECRETS_DIR};
use crate::database::{Database, JobRecord, LogFormat, LogType, NewLog, TaskRecord};
use crate::inventory::InventoryBuilder;
use crate::params::ConfigService;
use crate::planner::jinja;

/// `<script_type>-<stdout|stderr>.txt` inside the work dir
pub fn log_file(work_dir: &Path, script_type: ScriptType, log_type: LogType) -> PathBuf {
    work_dir.join(format!("{}-{}.txt", script_type.as_str(), log_type.as_str()))
}

/// Command line of an external script
pub fn build_command(
    executor: &ExecutorConfig,
    spec: &SubactionSpec,
    script_path: &Path,
    verbose: bool,
) -> Result<Vec<String>> {
    let script = script_path.display().to_string();
    match spec.script_type {
        ScriptType::Ansible => {
            let mut command = vec![
                executor.ansible_command.clone(),
                "-i".to_string(),
                INVENTORY_FILE.to_string(),
                script,
                "-e".to_string(),
                format!("@{}", CONFIG_FILE),
            ];
            if verbose {
                command.push("-vvvv".to_string());
            }
            Ok(command)
        }
        ScriptType::Python => Ok(vec![
            executor.python_command.clone(),
            script,
            CONFIG_FILE.to_string(),
        ]),
        ScriptType::Internal => Err(anyhow!(
            "internal script {} has no command line",
            spec.script
        )),
    }
}

/// stdout/stderr of the script plus any `*.log` it left in the work dir
pub async fn collect_job_logs(script_type: ScriptType, work_dir: &Path) -> Result<Vec<NewLog>> {
    let mut logs = Vec::new();
    for log_type in [LogType::Stdout, LogType::Stderr] {
        let path = log_file(work_dir, script_type, log_type);
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        logs.push(NewLog {
            name: script_type.as_str().to_string(),
            log_type,
            format: LogFormat::Txt,
            body: if exists { None } else { Some(String::new()) },
            file: exists.then(|| path.display().to_string()),
        });
    }

    let pattern = work_dir.join(CUSTOM_LOG_PATTERN).display().to_string();
    let mut custom: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid log pattern {}", pattern))?
        .filter_map(|entry| entry.ok())
        .collect();
    custom.sort();
    for path in custom {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => logs.push(NewLog {
                name,
                log_type: LogType::Custom,
                format: LogFormat::Txt,
                body: Some(body),
                file: Some(path.display().to_string()),
            }),
            Err(e) => warn!("Skipping unreadable log {}: {}", path.display(), e),
        }
    }
    Ok(logs)
}

/// `context` section: object type and the ids of the object and its ancestors
fn job_context(task: &TaskRecord) -> Value {
    let mut context = Map::new();
    context.insert("type".into(), json!(task.object.object_type.as_str()));
    for (kind, entry) in &task.selector {
        context.insert(format!("{}_id", kind), json!(entry.id));
    }
    Value::Object(context)
}

pub struct JobPreparer {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    config: Arc<ConfigService>,
    inventory: Arc<InventoryBuilder>,
    settings: Arc<Config>,
}

impl JobPreparer {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        config: Arc<ConfigService>,
        inventory: Arc<InventoryBuilder>,
        settings: Arc<Config>,
    ) -> Self {
        Self {
            db,
            catalog,
            config,
            inventory,
            settings,
        }
    }

    #[instrument(skip(self, task, job), fields(task_id = task.id, job_id = job.id))]
    pub async fn prepare(&self, task: &TaskRecord, job: &JobRecord) -> Result<PreparedJob> {
        let work_dir = self.settings.dirs.job_dir(job.id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        self.db
            .set_job_log_dir(job.id, &work_dir.display().to_string())
            .await?;

        let action = self.catalog.action(task.action_id).await?;
        let prototype = self.catalog.prototype(action.prototype_id).await?;
        let bundle = self.catalog.get_bundle(prototype.bundle_id).await?;
        let script_path =
            jinja::template_path(&self.settings.dirs.bundle_dir(&bundle.hash), &job.spec.script)?;

        let mut job_config = task.config.clone().unwrap_or_else(|| json!({}));
        self.config.cipher().reveal(&mut job_config)?;

        let command = build_command(&self.settings.executor, &job.spec, &script_path, task.verbose)?;
        let mut job_section = json!({
            "id": job.id,
            "action": action.name,
            "job_name": job.name,
            "command": job.name,
            "script": job.spec.script,
            "script_type": job.spec.script_type.as_str(),
            "verbose": task.verbose,
            "playbook": script_path.display().to_string(),
            "config": job_config,
            "params": job.spec.params,
            "cluster_id": task.selector.get("cluster").map(|c| c.id),
        });
        if let Some(delta) = &task.hostcomponent {
            job_section["hostcomponent"] = json!(delta.desired());
        }

        let payload = json!({
            "adcm": {"config": self.settings.global_settings},
            "context": job_context(task),
            "env": {
                "run_dir": self.settings.dirs.run_dir,
                "log_dir": work_dir,
                "tmp_dir": self.settings.dirs.tmp_dir,
                "stack_dir": self.settings.dirs.stack_dir,
                "status_api_token": self.settings.status.secret_key,
            },
            "job": job_section,
        });
        tokio::fs::write(work_dir.join(CONFIG_FILE), serde_json::to_string_pretty(&payload)?)
            .await
            .context("Failed to write job config")?;

        let inventory = self.inventory.build(task, &work_dir).await?;
        tokio::fs::write(work_dir.join(INVENTORY_FILE), serde_json::to_string_pretty(&inventory)?)
            .await
            .context("Failed to write job inventory")?;

        let env = BTreeMap::from([
            ("ADCM_CALLBACK_URL".to_string(), self.settings.callback_url.clone()),
            ("ADCM_JOB_ID".to_string(), job.id.to_string()),
            ("ADCM_JOB_TOKEN".to_string(), job.token.clone()),
            ("ADCM_RUN_DIR".to_string(), self.settings.dirs.run_dir.display().to_string()),
        ]);

        debug!("Prepared job #{} in {}", job.id, work_dir.display());
        Ok(PreparedJob {
            job: job.clone(),
            task: task.clone(),
            work_dir,
            command,
            env,
        })
    }

    /// Persist the logs a finished job left behind
    pub async fn collect_logs(&self, prepared: &PreparedJob) -> Result<usize> {
        let logs = collect_job_logs(prepared.job.spec.script_type, &prepared.work_dir).await?;
        for log in &logs {
            self.db.insert_log(prepared.job.id, log).await?;
        }
        Ok(logs.len())
    }

    /// Drop plaintext secret files; logs and payloads stay for inspection
    pub async fn cleanup(&self, prepared: &PreparedJob) -> Result<()> {
        let secrets = prepared.work_dir.join(SECRETS_DIR);
        match tokio::fs::remove_dir_all(&secrets).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", secrets.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ObjectRef, SelectorEntry, TaskStatus, TaskTarget};
    use chrono::Utc;
    use tempfile::TempDir;

    fn spec(script_type: ScriptType) -> SubactionSpec {
        SubactionSpec {
            name: "install".into(),
            display_name: None,
            script: "playbooks/install.yaml".into(),
            script_type,
            state_on_fail: None,
            multi_state_on_fail_set: vec![],
            multi_state_on_fail_unset: vec![],
            allow_to_terminate: None,
            params: Value::Null,
        }
    }

    #[test]
    fn test_ansible_command() {
        let executor = ExecutorConfig::default();
        let command = build_command(
            &executor,
            &spec(ScriptType::Ansible),
            Path::new("/b/playbooks/install.yaml"),
            true,
        )
        .unwrap();
        assert_eq!(
            command,
            vec![
                "ansible-playbook",
                "-i",
                "inventory.json",
                "/b/playbooks/install.yaml",
                "-e",
                "@config.json",
                "-vvvv"
            ]
        );
    }

    #[test]
    fn test_python_and_internal_commands() {
        let executor = ExecutorConfig::default();
        let command =
            build_command(&executor, &spec(ScriptType::Python), Path::new("/b/run.py"), false).unwrap();
        assert_eq!(command[1..], ["/b/run.py".to_string(), "config.json".to_string()]);
        assert!(build_command(&executor, &spec(ScriptType::Internal), Path::new("x"), false).is_err());
    }

    #[tokio::test]
    async fn test_collect_logs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(log_file(dir.path(), ScriptType::Ansible, LogType::Stdout), "ok").unwrap();
        std::fs::write(dir.path().join("deploy.log"), "custom output").unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();

        let logs = collect_job_logs(ScriptType::Ansible, dir.path()).await.unwrap();
        assert_eq!(logs.len(), 3);

        assert_eq!(logs[0].log_type, LogType::Stdout);
        assert!(logs[0].file.as_deref().unwrap().ends_with("ansible-stdout.txt"));
        assert_eq!(logs[1].log_type, LogType::Stderr);
        assert_eq!(logs[1].body.as_deref(), Some(""));
        assert_eq!(logs[2].log_type, LogType::Custom);
        assert_eq!(logs[2].name, "deploy");
        assert_eq!(logs[2].body.as_deref(), Some("custom output"));
    }

    #[test]
    fn test_job_context_lists_ancestors() {
        let mut selector = BTreeMap::new();
        selector.insert("component".to_string(), SelectorEntry { id: 7, name: "master".into() });
        selector.insert("service".to_string(), SelectorEntry { id: 4, name: "db".into() });
        selector.insert("cluster".to_string(), SelectorEntry { id: 1, name: "Test".into() });
        let task = TaskRecord {
            id: 1,
            action_id: 1,
            object: ObjectRef::component(7),
            target: TaskTarget::Object(ObjectRef::component(7)),
            config: None,
            attr: json!({}),
            verbose: false,
            hostcomponent: None,
            status: TaskStatus::Running,
            executor: None,
            selector,
            owner_user: "admin".into(),
            start_date: None,
            finish_date: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            job_context(&task),
            json!({"type": "component", "component_id": 7, "service_id": 4, "cluster_id": 1})
        );
    }
}
