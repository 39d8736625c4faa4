//! `local` environment: scripts run as child processes of the conductor.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tracing::{info, instrument, warn};

use super::workdir::log_file;
use super::{cancelled, JobExecutor, JobOutcome, PreparedJob};
use crate::config::ExecutionEnvironment;
use crate::constants::jobs::TERMINATE_GRACE;
use crate::database::{JobRecord, LogType};

pub struct LocalExecutor {
    /// job id -> child pid
    running: Arc<RwLock<HashMap<i64, u32>>>,
    worker_id: String,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            running: Arc::new(RwLock::new(HashMap::new())),
            worker_id: format!("local-{}", std::process::id()),
        }
    }

    pub async fn running_jobs(&self) -> Vec<i64> {
        self.running.read().await.keys().copied().collect()
    }

    async fn open_log(prepared: &PreparedJob, log_type: LogType) -> Result<Stdio> {
        let path = log_file(&prepared.work_dir, prepared.job.spec.script_type, log_type);
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Stdio::from(file.into_std().await))
    }
}

#[async_trait]
impl JobExecutor for LocalExecutor {
    fn environment(&self) -> ExecutionEnvironment {
        ExecutionEnvironment::Local
    }

    fn worker_id(&self) -> String {
        self.worker_id.clone()
    }

    #[instrument(skip(self, prepared, cancel), fields(job_id = prepared.job.id))]
    async fn execute(&self, prepared: &PreparedJob, cancel: watch::Receiver<bool>) -> Result<JobOutcome> {
        let (program, args) = prepared
            .command
            .split_first()
            .ok_or_else(|| anyhow!("Job #{} has an empty command", prepared.job.id))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&prepared.work_dir)
            .envs(&prepared.env)
            .stdin(Stdio::null())
            .stdout(Self::open_log(prepared, LogType::Stdout).await?)
            .stderr(Self::open_log(prepared, LogType::Stderr).await?)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let job_id = prepared.job.id;
        if let Some(pid) = child.id() {
            self.running.write().await.insert(job_id, pid);
            info!("Job #{} started as pid {}", job_id, pid);
        }

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancelled(cancel) => None,
        };

        let outcome = match finished {
            Some(status) => {
                let status = status.with_context(|| format!("Failed to wait for job #{}", job_id))?;
                if status.success() {
                    JobOutcome::success()
                } else {
                    JobOutcome::failed(status.code())
                }
            }
            None => {
                info!("Terminating job #{}", job_id);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill job #{}: {}", job_id, e);
                }
                if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
                    warn!("Job #{} did not exit within {:?}", job_id, TERMINATE_GRACE);
                }
                JobOutcome::aborted()
            }
        };

        self.running.write().await.remove(&job_id);
        Ok(outcome)
    }

    async fn is_alive(&self, job: &JobRecord) -> Result<bool> {
        Ok(self.running.read().await.contains_key(&job.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::definition::{ScriptType, SubactionSpec};
    use crate::database::{JobStatus, ObjectRef, TaskRecord, TaskStatus, TaskTarget};
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn prepared(dir: &Path, script: &str) -> PreparedJob {
        let spec = SubactionSpec {
            name: "run".into(),
            display_name: None,
            script: "run.py".into(),
            script_type: ScriptType::Python,
            state_on_fail: None,
            multi_state_on_fail_set: vec![],
            multi_state_on_fail_unset: vec![],
            allow_to_terminate: None,
            params: Value::Null,
        };
        PreparedJob {
            job: JobRecord {
                id: 42,
                task_id: 1,
                position: 0,
                name: "run".into(),
                spec,
                status: JobStatus::Running,
                start_date: None,
                finish_date: None,
                log_dir: None,
                token: "t".into(),
            },
            task: TaskRecord {
                id: 1,
                action_id: 1,
                object: ObjectRef::cluster(1),
                target: TaskTarget::Object(ObjectRef::cluster(1)),
                config: None,
                attr: json!({}),
                verbose: false,
                hostcomponent: None,
                status: TaskStatus::Running,
                executor: None,
                selector: BTreeMap::new(),
                owner_user: "admin".into(),
                start_date: None,
                finish_date: None,
                created_at: Utc::now(),
            },
            work_dir: dir.to_path_buf(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_success_writes_stdout() {
        let dir = TempDir::new().unwrap();
        let executor = LocalExecutor::new();
        let (_tx, rx) = watch::channel(false);

        let outcome = executor
            .execute(&prepared(dir.path(), "echo $GREETING"), rx)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::success());

        let stdout = std::fs::read_to_string(dir.path().join("python-stdout.txt")).unwrap();
        assert_eq!(stdout.trim(), "hello");
        assert!(executor.running_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(false);
        let outcome = LocalExecutor::new()
            .execute(&prepared(dir.path(), "echo boom >&2; exit 3"), rx)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::failed(Some(3)));
        let stderr = std::fs::read_to_string(dir.path().join("python-stderr.txt")).unwrap();
        assert_eq!(stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_job() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(LocalExecutor::new());
        let (tx, rx) = watch::channel(false);

        let job = prepared(dir.path(), "sleep 30");
        let runner = {
            let executor = executor.clone();
            let job = job.clone();
            tokio::spawn(async move { executor.execute(&job, rx).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(executor.is_alive(&job.job).await.unwrap());

        tx.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, JobOutcome::aborted());
        assert!(!executor.is_alive(&job.job).await.unwrap());
    }
}
