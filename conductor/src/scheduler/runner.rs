//! Executes the jobs of one task in order and finalises it.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::catalog::definition::ScriptType;
use crate::catalog::Catalog;
use crate::database::{
    Database, JobRecord, JobStatus, LogFormat, LogType, NewLog, TaskRecord, TaskStatus,
};
use crate::effects::EffectApplier;
use crate::events::{DomainEvent, EventBus};
use crate::executor::{InternalScripts, JobExecutor, JobOutcome, JobPreparer};

fn inline_log(name: &str, log_type: LogType, body: String) -> NewLog {
    NewLog {
        name: name.to_string(),
        log_type,
        format: LogFormat::Txt,
        body: Some(body),
        file: None,
    }
}

pub struct TaskRunner {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    preparer: Arc<JobPreparer>,
    internal: Arc<InternalScripts>,
    executor: Arc<dyn JobExecutor>,
    effects: Arc<EffectApplier>,
    events: EventBus,
}

impl TaskRunner {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        preparer: Arc<JobPreparer>,
        internal: Arc<InternalScripts>,
        executor: Arc<dyn JobExecutor>,
        effects: Arc<EffectApplier>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            catalog,
            preparer,
            internal,
            executor,
            effects,
            events,
        }
    }

    pub fn executor(&self) -> &Arc<dyn JobExecutor> {
        &self.executor
    }

    /// Run a QUEUED task to a terminal status; the task is finalised once,
    /// as BROKEN when running its jobs fails
    #[instrument(skip(self, task, cancel), fields(task_id = task.id))]
    pub async fn run(&self, task: TaskRecord, cancel: watch::Receiver<bool>) -> Result<TaskStatus> {
        let status = match self.run_jobs(&task, cancel).await {
            Ok(Some(status)) => status,
            Ok(None) => return self.current_status(task.id).await,
            Err(e) => {
                error!("Task #{} runner failed: {:#}", task.id, e);
                if let Err(e) = self.db.abort_unfinished_jobs(task.id).await {
                    warn!("Jobs of task #{} left unfinished: {:#}", task.id, e);
                }
                TaskStatus::Broken
            }
        };
        self.finish(&task, status).await?;
        Ok(status)
    }

    async fn run_jobs(&self, task: &TaskRecord, cancel: watch::Receiver<bool>) -> Result<Option<TaskStatus>> {
        if !self.db.update_task_status(task.id, TaskStatus::Running).await? {
            info!("Task #{} finished before it could start", task.id);
            return Ok(None);
        }
        self.publish_task(task, TaskStatus::Running);

        let action = self.catalog.action(task.action_id).await?;
        let jobs = self.db.list_jobs(task.id).await?;

        let mut any_failed = false;
        let mut aborted = false;
        for job in &jobs {
            if *cancel.borrow() {
                aborted = true;
                break;
            }

            self.db.update_job_status(job.id, JobStatus::Running).await?;
            self.publish_job(job, JobStatus::Running);

            let outcome = match self.run_job(task, job, cancel.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Job #{} ({}) could not run: {:#}", job.id, job.name, e);
                    self.db
                        .insert_log(job.id, &inline_log(&job.name, LogType::Stderr, format!("{:#}", e)))
                        .await?;
                    JobOutcome::failed(None)
                }
            };

            self.db.update_job_status(job.id, outcome.status).await?;
            self.publish_job(job, outcome.status);

            match outcome.status {
                JobStatus::Success => {}
                JobStatus::Aborted => {
                    aborted = true;
                    break;
                }
                _ => {
                    any_failed = true;
                    info!(
                        "Job #{} ({}) failed with exit code {:?}",
                        job.id, job.name, outcome.exit_code
                    );
                    self.effects.apply_job_failure(task, job).await?;
                    if !action.spec.partial_execution {
                        break;
                    }
                }
            }
        }

        self.db.abort_unfinished_jobs(task.id).await?;
        let status = if aborted {
            TaskStatus::Aborted
        } else if any_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Success
        };
        Ok(Some(status))
    }

    async fn run_job(&self, task: &TaskRecord, job: &JobRecord, cancel: watch::Receiver<bool>) -> Result<JobOutcome> {
        if job.spec.script_type == ScriptType::Internal {
            return match self.internal.run(task, job).await {
                Ok(message) => {
                    self.db
                        .insert_log(job.id, &inline_log(ScriptType::Internal.as_str(), LogType::Stdout, message))
                        .await?;
                    Ok(JobOutcome::success())
                }
                Err(e) => {
                    warn!("Internal script {} failed: {:#}", job.spec.script, e);
                    self.db
                        .insert_log(
                            job.id,
                            &inline_log(ScriptType::Internal.as_str(), LogType::Stderr, format!("{:#}", e)),
                        )
                        .await?;
                    Ok(JobOutcome::failed(Some(1)))
                }
            };
        }

        let prepared = self.preparer.prepare(task, job).await?;
        let outcome = self.executor.execute(&prepared, cancel).await;

        if let Err(e) = self.preparer.collect_logs(&prepared).await {
            warn!("Failed to collect logs of job #{}: {}", job.id, e);
        }
        if let Err(e) = self.preparer.cleanup(&prepared).await {
            warn!("Failed to clean up job #{}: {}", job.id, e);
        }
        outcome
    }

    /// Effects and lock release first, then the terminal status
    async fn finish(&self, task: &TaskRecord, status: TaskStatus) -> Result<()> {
        if let Err(e) = self.effects.finalize_task(task, status).await {
            error!("Finalising task #{} as {} failed: {:#}", task.id, status, e);
            if self.db.update_task_status(task.id, TaskStatus::Broken).await? {
                self.publish_task(task, TaskStatus::Broken);
            }
            return Err(e);
        }
        if self.db.update_task_status(task.id, status).await? {
            self.publish_task(task, status);
        }
        Ok(())
    }

    async fn current_status(&self, task_id: i64) -> Result<TaskStatus> {
        Ok(self
            .db
            .get_task(task_id)
            .await?
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Broken))
    }

    fn publish_task(&self, task: &TaskRecord, status: TaskStatus) {
        self.events.publish(DomainEvent::TaskStatus {
            task_id: task.id,
            object: task.object,
            status,
        });
    }

    fn publish_job(&self, job: &JobRecord, status: JobStatus) {
        self.events.publish(DomainEvent::JobStatus {
            job_id: job.id,
            task_id: job.task_id,
            status,
        });
    }
}
