//! `celery` environment: jobs are handed to an out-of-process runner agent
//! over HTTP and polled until they finish.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::workdir::log_file;
use super::{cancelled, JobExecutor, JobOutcome, PreparedJob};
use crate::config::{ExecutionEnvironment, ExecutorConfig};
use crate::constants::http::{CONNECT_TIMEOUT, MAX_FAILED_POLLS, REQUEST_TIMEOUT};
use crate::database::{JobRecord, LogType};

#[derive(Debug, Serialize)]
struct RunJobRequest<'a> {
    job_id: i64,
    work_dir: String,
    command: &'a [String],
    env: &'a BTreeMap<String, String>,
    stdout_file: String,
    stderr_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RunnerJobStatus {
    Running,
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Deserialize)]
struct RunnerJob {
    status: RunnerJobStatus,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct RunnerLogs {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T> {
        if !self.success {
            return Err(anyhow!(
                "Runner error: {}",
                self.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        self.data.ok_or_else(|| anyhow!("Runner response carries no data"))
    }
}

pub struct RemoteExecutor {
    client: Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
}

impl RemoteExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        if config.runner_url.is_empty() {
            return Err(anyhow!("celery environment requires executor.runner_url"));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: config.runner_url.trim_end_matches('/').to_string(),
            api_key: config.runner_api_key.clone(),
            poll_interval: Duration::from_secs(config.runner_poll_seconds),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn submit(&self, prepared: &PreparedJob) -> Result<()> {
        let script_type = prepared.job.spec.script_type;
        let request = RunJobRequest {
            job_id: prepared.job.id,
            work_dir: prepared.work_dir.display().to_string(),
            command: &prepared.command,
            env: &prepared.env,
            stdout_file: log_file(&prepared.work_dir, script_type, LogType::Stdout)
                .display()
                .to_string(),
            stderr_file: log_file(&prepared.work_dir, script_type, LogType::Stderr)
                .display()
                .to_string(),
        };
        let response = self
            .client
            .post(self.url("/jobs"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Runner request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Runner rejected job #{} with {}: {}", prepared.job.id, status, body));
        }
        response.json::<Envelope<serde_json::Value>>().await?.into_data()?;
        Ok(())
    }

    /// `None` when the runner does not know the job
    async fn job_info(&self, job_id: i64) -> Result<Option<RunnerJob>> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{}", job_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                Ok(Some(response.json::<Envelope<RunnerJob>>().await?.into_data()?))
            }
            status => Err(anyhow!("Runner answered {} for job #{}", status, job_id)),
        }
    }

    async fn terminate(&self, job_id: i64) {
        let result = self
            .client
            .post(self.url(&format!("/jobs/{}/terminate", job_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!("Requested termination of job #{}", job_id)
            }
            Ok(response) => warn!("Runner refused to terminate job #{}: {}", job_id, response.status()),
            Err(e) => warn!("Failed to reach runner to terminate job #{}: {}", job_id, e),
        }
    }

    /// Copy runner-side logs into the work dir when it is not shared
    async fn fetch_logs(&self, prepared: &PreparedJob) -> Result<()> {
        let script_type = prepared.job.spec.script_type;
        let stdout_path = log_file(&prepared.work_dir, script_type, LogType::Stdout);
        if tokio::fs::try_exists(&stdout_path).await.unwrap_or(false) {
            return Ok(());
        }
        let logs = self
            .client
            .get(self.url(&format!("/jobs/{}/logs", prepared.job.id)))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .json::<Envelope<RunnerLogs>>()
            .await?
            .into_data()?;
        tokio::fs::write(&stdout_path, logs.stdout).await?;
        tokio::fs::write(log_file(&prepared.work_dir, script_type, LogType::Stderr), logs.stderr)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobExecutor for RemoteExecutor {
    fn environment(&self) -> ExecutionEnvironment {
        ExecutionEnvironment::Celery
    }

    fn worker_id(&self) -> String {
        self.base_url.clone()
    }

    #[instrument(skip(self, prepared, cancel), fields(job_id = prepared.job.id))]
    async fn execute(&self, prepared: &PreparedJob, cancel: tokio::sync::watch::Receiver<bool>) -> Result<JobOutcome> {
        let job_id = prepared.job.id;
        self.submit(prepared).await?;
        info!("Job #{} submitted to runner {}", job_id, self.base_url);

        let cancel_signal = cancelled(cancel);
        tokio::pin!(cancel_signal);
        let mut terminate_sent = false;
        let mut failed_polls = 0;

        loop {
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = &mut cancel_signal, if !terminate_sent => {
                    self.terminate(job_id).await;
                    terminate_sent = true;
                }
            }

            match self.job_info(job_id).await {
                Ok(Some(job)) => {
                    failed_polls = 0;
                    let outcome = match job.status {
                        RunnerJobStatus::Running => {
                            debug!("Job #{} still running", job_id);
                            continue;
                        }
                        _ if terminate_sent => JobOutcome::aborted(),
                        RunnerJobStatus::Success => JobOutcome::success(),
                        RunnerJobStatus::Failed => JobOutcome::failed(job.exit_code),
                        RunnerJobStatus::Aborted => JobOutcome::aborted(),
                    };
                    if let Err(e) = self.fetch_logs(prepared).await {
                        warn!("Failed to fetch logs of job #{}: {}", job_id, e);
                    }
                    return Ok(outcome);
                }
                Ok(None) => {
                    warn!("Runner no longer knows job #{}", job_id);
                    return Ok(JobOutcome::failed(None));
                }
                Err(e) => {
                    failed_polls += 1;
                    warn!(
                        "Polling job #{} failed ({}/{}): {}",
                        job_id, failed_polls, MAX_FAILED_POLLS, e
                    );
                    if failed_polls >= MAX_FAILED_POLLS {
                        return Ok(JobOutcome::failed(None));
                    }
                }
            }
        }
    }

    async fn is_alive(&self, job: &JobRecord) -> Result<bool> {
        Ok(matches!(
            self.job_info(job.id).await?,
            Some(RunnerJob {
                status: RunnerJobStatus::Running,
                ..
            })
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::definition::{ScriptType, SubactionSpec};
    use crate::database::{JobStatus, ObjectRef, TaskRecord, TaskStatus, TaskTarget};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job_record() -> JobRecord {
        JobRecord {
            id: 42,
            task_id: 1,
            position: 0,
            name: "install".into(),
            spec: SubactionSpec {
                name: "install".into(),
                display_name: None,
                script: "install.yaml".into(),
                script_type: ScriptType::Ansible,
                state_on_fail: None,
                multi_state_on_fail_set: vec![],
                multi_state_on_fail_unset: vec![],
                allow_to_terminate: None,
                params: serde_json::Value::Null,
            },
            status: JobStatus::Running,
            start_date: None,
            finish_date: None,
            log_dir: None,
            token: "t".into(),
        }
    }

    fn prepared(dir: &TempDir) -> PreparedJob {
        PreparedJob {
            job: job_record(),
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
            work_dir: dir.path().to_path_buf(),
            command: vec!["ansible-playbook".into()],
            env: BTreeMap::new(),
        }
    }

    fn executor(server: &MockServer) -> RemoteExecutor {
        let config = ExecutorConfig {
            runner_url: server.uri(),
            runner_api_key: "key".into(),
            ..ExecutorConfig::default()
        };
        RemoteExecutor::new(&config)
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn accept_jobs(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .and(header("authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"success": true, "data": {"job_id": 42, "status": "running"}}),
            ))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_job_success_fetches_logs() {
        let server = MockServer::start().await;
        accept_jobs(&server).await;
        Mock::given(method("GET"))
            .and(path("/jobs/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"success": true, "data": {"job_id": 42, "status": "success", "exit_code": 0}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/42/logs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"success": true, "data": {"stdout": "PLAY RECAP", "stderr": ""}}),
            ))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let outcome = executor(&server).execute(&prepared(&dir), rx).await.unwrap();

        assert_eq!(outcome, JobOutcome::success());
        let stdout = std::fs::read_to_string(dir.path().join("ansible-stdout.txt")).unwrap();
        assert_eq!(stdout, "PLAY RECAP");
    }

    #[tokio::test]
    async fn test_unreachable_runner_fails_job() {
        let server = MockServer::start().await;
        accept_jobs(&server).await;
        Mock::given(method("GET"))
            .and(path("/jobs/42"))
            .respond_with(ResponseTemplate::new(500))
            .expect(u64::from(MAX_FAILED_POLLS))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let outcome = executor(&server).execute(&prepared(&dir), rx).await.unwrap();
        assert_eq!(outcome, JobOutcome::failed(None));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_alive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(!executor(&server).is_alive(&job_record()).await.unwrap());
    }

    #[test]
    fn test_error_envelope_needs_no_data() {
        let envelope: Envelope<RunnerJob> =
            serde_json::from_value(json!({"success": false, "error": "job 42 not found"})).unwrap();
        let err = envelope.into_data().unwrap_err();
        assert!(err.to_string().contains("job 42 not found"));

        let empty: Envelope<RunnerJob> = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(empty.into_data().is_err());
    }

    #[test]
    fn test_runner_url_is_required() {
        assert!(RemoteExecutor::new(&ExecutorConfig::default()).is_err());
    }
}
