// File: runner/src/services/job_manager.rs
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::types::{JobInfo, JobLogs, JobStatus, RunJobRequest};

/// How long a terminated child gets to exit after the kill request
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

struct JobEntry {
    info: JobInfo,
    cancel: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<i64, JobEntry>>>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn the job's process; resubmitting a running job returns it as is
    pub async fn start_job(&self, request: RunJobRequest) -> Result<JobInfo> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&request.job_id) {
            if !existing.info.status.is_finished() {
                info!("Job {} is already running", request.job_id);
                return Ok(existing.info.clone());
            }
        }

        let child = spawn_child(&request).await?;
        let pid = child.id();
        let (cancel, cancel_rx) = watch::channel(false);
        let info = JobInfo {
            job_id: request.job_id,
            status: JobStatus::Running,
            exit_code: None,
            pid,
            work_dir: request.work_dir.clone(),
            stdout_file: request.stdout_file.clone(),
            stderr_file: request.stderr_file.clone(),
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        jobs.insert(request.job_id, JobEntry { info: info.clone(), cancel });
        drop(jobs);

        info!("Started job {} (pid {:?}): {}", request.job_id, pid, request.command.join(" "));
        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(request.job_id, child, cancel_rx).await;
        });
        Ok(info)
    }

    async fn supervise(&self, job_id: i64, mut child: Child, mut cancel: watch::Receiver<bool>) {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.wait_for(|c| *c) => None,
        };

        let (status, exit_code, error_message) = match waited {
            Some(Ok(status)) => outcome(status),
            Some(Err(e)) => (JobStatus::Failed, None, Some(format!("wait failed: {}", e))),
            None => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill job {}: {}", job_id, e);
                }
                let exit_code = match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(e)) => {
                        warn!("Job {} did not report its exit: {}", job_id, e);
                        None
                    }
                    Err(_) => {
                        error!("Job {} ignored termination for {:?}", job_id, TERMINATE_GRACE);
                        None
                    }
                };
                (JobStatus::Aborted, exit_code, None)
            }
        };
        self.finish_job(job_id, status, exit_code, error_message).await;
    }

    async fn finish_job(&self, job_id: i64, status: JobStatus, exit_code: Option<i32>, error_message: Option<String>) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(&job_id) {
            entry.info.status = status;
            entry.info.exit_code = exit_code;
            entry.info.completed_at = Some(Utc::now());
            entry.info.error_message = error_message;
            match status {
                JobStatus::Success => info!("Job {} completed successfully", job_id),
                _ => warn!("Job {} finished as {:?} (exit code {:?})", job_id, status, exit_code),
            }
        }
    }

    /// Ask a running job to stop; false when the job is unknown
    pub async fn terminate(&self, job_id: i64) -> bool {
        let jobs = self.jobs.read().await;
        match jobs.get(&job_id) {
            Some(entry) => {
                if !entry.info.status.is_finished() {
                    info!("Terminating job {}", job_id);
                    let _ = entry.cancel.send(true);
                }
                true
            }
            None => false,
        }
    }

    pub async fn get_job(&self, job_id: i64) -> Option<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.get(&job_id).map(|entry| entry.info.clone())
    }

    /// Current contents of the job's log files; missing files read as empty
    pub async fn read_logs(&self, job_id: i64) -> Option<JobLogs> {
        let info = self.get_job(job_id).await?;
        Some(JobLogs {
            stdout: tokio::fs::read_to_string(&info.stdout_file).await.unwrap_or_default(),
            stderr: tokio::fs::read_to_string(&info.stderr_file).await.unwrap_or_default(),
        })
    }

    /// Forget finished jobs started more than `max_hours` ago
    pub async fn cleanup_old_jobs(&self, max_hours: i64) -> u32 {
        let mut jobs = self.jobs.write().await;
        let cutoff = Utc::now() - chrono::Duration::hours(max_hours);
        let initial_count = jobs.len();

        jobs.retain(|job_id, entry| {
            let should_keep = !entry.info.status.is_finished() || entry.info.started_at > cutoff;
            if !should_keep {
                info!("Cleaned up old job: {} ({:?})", job_id, entry.info.status);
            }
            should_keep
        });

        let cleaned = initial_count - jobs.len();
        if cleaned > 0 {
            info!("Cleaned up {} old jobs older than {}h", cleaned, max_hours);
        }
        cleaned as u32
    }

    pub async fn get_running_jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|entry| !entry.info.status.is_finished())
            .map(|entry| entry.info.clone())
            .collect()
    }
}

fn outcome(status: ExitStatus) -> (JobStatus, Option<i32>, Option<String>) {
    if status.success() {
        (JobStatus::Success, status.code(), None)
    } else {
        (JobStatus::Failed, status.code(), None)
    }
}

async fn spawn_child(request: &RunJobRequest) -> Result<Child> {
    let Some((program, args)) = request.command.split_first() else {
        return Err(anyhow!("job {} has an empty command", request.job_id));
    };
    let stdout = tokio::fs::File::create(&request.stdout_file)
        .await
        .map_err(|e| anyhow!("Failed to create {}: {}", request.stdout_file, e))?
        .into_std()
        .await;
    let stderr = tokio::fs::File::create(&request.stderr_file)
        .await
        .map_err(|e| anyhow!("Failed to create {}: {}", request.stderr_file, e))?
        .into_std()
        .await;

    Command::new(program)
        .args(args)
        .current_dir(&request.work_dir)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}", program, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn request(dir: &TempDir, job_id: i64, script: &str) -> RunJobRequest {
        RunJobRequest {
            job_id,
            work_dir: dir.path().display().to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            stdout_file: dir.path().join("stdout.txt").display().to_string(),
            stderr_file: dir.path().join("stderr.txt").display().to_string(),
        }
    }

    async fn wait_finished(manager: &JobManager, job_id: i64) -> JobInfo {
        for _ in 0..200 {
            if let Some(info) = manager.get_job(job_id).await {
                if info.status.is_finished() {
                    return info;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_job_output_goes_to_files() {
        let dir = TempDir::new().unwrap();
        let manager = JobManager::new();
        manager
            .start_job(request(&dir, 1, "echo $GREETING; echo oops >&2"))
            .await
            .unwrap();

        let info = wait_finished(&manager, 1).await;
        assert_eq!(info.status, JobStatus::Success);
        assert_eq!(info.exit_code, Some(0));

        let logs = manager.read_logs(1).await.unwrap();
        assert_eq!(logs.stdout.trim(), "hello");
        assert_eq!(logs.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = TempDir::new().unwrap();
        let manager = JobManager::new();
        manager.start_job(request(&dir, 2, "exit 4")).await.unwrap();

        let info = wait_finished(&manager, 2).await;
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_terminate_aborts() {
        let dir = TempDir::new().unwrap();
        let manager = JobManager::new();
        manager.start_job(request(&dir, 3, "sleep 30")).await.unwrap();

        assert!(manager.terminate(3).await);
        let info = wait_finished(&manager, 3).await;
        assert_eq!(info.status, JobStatus::Aborted);
        assert!(!manager.terminate(99).await);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = JobManager::new();
        let mut bad = request(&dir, 4, "true");
        bad.command.clear();
        assert!(manager.start_job(bad).await.is_err());
        assert!(manager.get_job(4).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_running_jobs() {
        let dir = TempDir::new().unwrap();
        let manager = JobManager::new();
        manager.start_job(request(&dir, 5, "sleep 30")).await.unwrap();
        manager.start_job(request(&dir, 6, "true")).await.unwrap();
        wait_finished(&manager, 6).await;

        assert_eq!(manager.cleanup_old_jobs(0).await, 1);
        assert!(manager.get_job(5).await.is_some());
        assert!(manager.get_job(6).await.is_none());
        manager.terminate(5).await;
    }
}
