//! Task scheduling: the CREATED -> QUEUED control loop, cancellation,
//! startup recovery and the liveness supervisor.
//!
//! # Lifecycle
//!
//! ```text
//! CREATED -> SCHEDULED -> QUEUED -> RUNNING -> SUCCESS | FAILED | ABORTED
//!    |           |
//!    |           +-> REVOKED (re-validation failed) | BROKEN (unexpected error)
//!    +-> REVOKED (cancelled before start)
//! ```
//!
//! Only the scheduler that flips a task from CREATED to SCHEDULED advances
//! it. Each queued task runs on its own tokio task; the registry of those
//! handles is what the supervisor and `cancel_task` consult.

pub mod rotation;
pub mod runner;

pub use rotation::ConfigRotation;
pub use runner::TaskRunner;

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::catalog::definition::ScriptType;
use crate::catalog::Catalog;
use crate::concerns::ConcernService;
use crate::config::SchedulerConfig;
use crate::database::{Database, ExecutorDescriptor, JobStatus, TaskRecord, TaskStatus};
use crate::effects::EffectApplier;
use crate::errors::{domain_error, ConductorError};
use crate::events::{DomainEvent, EventBus};
use crate::planner::ActionPlanner;

struct RunningTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct TaskScheduler {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
    planner: Arc<ActionPlanner>,
    concerns: Arc<ConcernService>,
    effects: Arc<EffectApplier>,
    runner: Arc<TaskRunner>,
    events: EventBus,
    settings: SchedulerConfig,
    running: Arc<Mutex<HashMap<i64, RunningTask>>>,
    /// Jobs found dead by the previous supervisor pass
    suspects: Mutex<HashSet<i64>>,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<Catalog>,
        planner: Arc<ActionPlanner>,
        concerns: Arc<ConcernService>,
        effects: Arc<EffectApplier>,
        runner: Arc<TaskRunner>,
        events: EventBus,
        settings: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            catalog,
            planner,
            concerns,
            effects,
            runner,
            events,
            settings,
            running: Arc::new(Mutex::new(HashMap::new())),
            suspects: Mutex::new(HashSet::new()),
        }
    }

    /// Poll for CREATED tasks until the process exits
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        info!("Task scheduler started, polling every {:?}", poll);
        tokio::spawn(async move {
            loop {
                match self.tick().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => error!("Scheduler tick failed: {:#}", e),
                }
                tokio::time::sleep(poll).await;
            }
        })
    }

    /// Periodically fail RUNNING tasks whose worker is gone
    pub fn start_supervisor(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.settings.supervisor_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = self.supervise().await {
                    error!("Supervisor pass failed: {:#}", e);
                }
            }
        })
    }

    /// Advance the oldest CREATED task; returns its id if there was one
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<Option<i64>> {
        let Some(task) = self.db.claim_next_created_task().await? else {
            return Ok(None);
        };

        if let Err(e) = self.admit(&task).await {
            let expected = domain_error(&e).is_some_and(|d| d.is_expected());
            let status = if expected {
                warn!("Task #{} revoked: {:#}", task.id, e);
                TaskStatus::Revoked
            } else {
                error!("Task #{} broken while scheduling: {:#}", task.id, e);
                TaskStatus::Broken
            };
            self.close(&task, status).await?;
        }
        Ok(Some(task.id))
    }

    async fn admit(&self, task: &TaskRecord) -> Result<()> {
        self.planner.revalidate(task).await?;

        let action = self.catalog.action(task.action_id).await?;
        if action.spec.blocking {
            self.concerns
                .acquire_task_lock(task, &action.display_name())
                .await?;
        }
        self.publish(task, TaskStatus::Scheduled);

        let executor = self.runner.executor();
        self.db
            .set_task_executor(
                task.id,
                &ExecutorDescriptor {
                    worker_id: executor.worker_id(),
                    environment: executor.environment(),
                },
            )
            .await?;
        if !self.db.update_task_status(task.id, TaskStatus::Queued).await? {
            info!("Task #{} was cancelled while scheduling", task.id);
            return Ok(());
        }
        self.publish(task, TaskStatus::Queued);
        self.spawn(task.clone()).await;
        Ok(())
    }

    async fn spawn(&self, task: TaskRecord) {
        let task_id = task.id;
        let (cancel, cancel_rx) = watch::channel(false);
        let runner = self.runner.clone();
        let registry = self.running.clone();

        let mut running = self.running.lock().await;
        let handle = tokio::spawn(async move {
            // Terminal status is already written when run returns
            if let Err(e) = runner.run(task.clone(), cancel_rx).await {
                error!("Task #{} did not finish cleanly: {:#}", task.id, e);
            }
            registry.lock().await.remove(&task.id);
        });
        running.insert(task_id, RunningTask { cancel, handle });
    }

    /// Terminate a task on operator request
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: i64) -> Result<TaskStatus> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or_else(|| ConductorError::ObjectNotFound {
                object: format!("task #{}", task_id),
            })?;

        match task.status {
            TaskStatus::Created => {
                self.close(&task, TaskStatus::Revoked).await?;
                info!("Task #{} revoked before start", task_id);
                Ok(TaskStatus::Revoked)
            }
            TaskStatus::Scheduled | TaskStatus::Queued | TaskStatus::Running => {
                self.check_terminable(&task).await?;
                let signalled = match self.running.lock().await.get(&task_id) {
                    Some(entry) => entry.cancel.send(true).is_ok(),
                    None => false,
                };
                if !signalled {
                    self.close(&task, TaskStatus::Aborted).await?;
                }
                info!("Task #{} termination requested", task_id);
                Ok(TaskStatus::Aborted)
            }
            status => Err(ConductorError::NotAllowedTermination {
                task_id,
                reason: format!("task is already {}", status),
            }
            .into()),
        }
    }

    async fn check_terminable(&self, task: &TaskRecord) -> Result<()> {
        let action = self.catalog.action(task.action_id).await?;
        if !action.spec.allow_to_terminate {
            return Err(ConductorError::NotAllowedTermination {
                task_id: task.id,
                reason: format!("action {} does not allow termination", action.name),
            }
            .into());
        }
        let jobs = self.db.list_jobs(task.id).await?;
        if let Some(job) = jobs.iter().find(|j| j.status == JobStatus::Running) {
            if job.spec.allow_to_terminate == Some(false) {
                return Err(ConductorError::NotAllowedTermination {
                    task_id: task.id,
                    reason: format!("job {} does not allow termination", job.name),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Tasks left mid-flight by a previous process become BROKEN
    #[instrument(skip(self))]
    pub async fn recover_stale(&self) -> Result<usize> {
        let mut recovered = 0;
        for status in [TaskStatus::Scheduled, TaskStatus::Queued, TaskStatus::Running] {
            for task in self.db.list_tasks_by_status(status).await? {
                if self.running.lock().await.contains_key(&task.id) {
                    continue;
                }
                error!("Task #{} was left {} by a previous run, marking BROKEN", task.id, status);
                self.close(&task, TaskStatus::Broken).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!("Recovered {} stale tasks", recovered);
        }
        Ok(recovered)
    }

    /// One liveness pass over RUNNING tasks
    pub async fn supervise(&self) -> Result<usize> {
        let mut failed = 0;
        let mut suspects = self.suspects.lock().await;
        let mut still_suspect = HashSet::new();

        for task in self.db.list_tasks_by_status(TaskStatus::Running).await? {
            let registered = self.running.lock().await.contains_key(&task.id);
            let lost = if !registered {
                true
            } else {
                let jobs = self.db.list_jobs(task.id).await?;
                let Some(job) = jobs
                    .into_iter()
                    .find(|j| j.status == JobStatus::Running && j.spec.script_type != ScriptType::Internal)
                else {
                    continue;
                };
                match self.runner.executor().is_alive(&job).await {
                    Ok(true) => false,
                    Ok(false) => {
                        still_suspect.insert(job.id);
                        suspects.contains(&job.id)
                    }
                    Err(e) => {
                        warn!("Liveness check of job #{} failed: {}", job.id, e);
                        false
                    }
                }
            };

            if lost {
                error!("Worker of task #{} vanished, marking FAILED", task.id);
                if let Some(entry) = self.running.lock().await.remove(&task.id) {
                    entry.handle.abort();
                }
                self.close(&task, TaskStatus::Failed).await?;
                failed += 1;
            }
        }

        *suspects = still_suspect;
        Ok(failed)
    }

    /// Terminal transition outside the runner: status first, then effects
    async fn close(&self, task: &TaskRecord, status: TaskStatus) -> Result<()> {
        if !self.db.update_task_status(task.id, status).await? {
            return Ok(());
        }
        self.db.abort_unfinished_jobs(task.id).await?;
        self.effects.finalize_task(task, status).await?;
        self.publish(task, status);
        Ok(())
    }

    fn publish(&self, task: &TaskRecord, status: TaskStatus) {
        self.events.publish(DomainEvent::TaskStatus {
            task_id: task.id,
            object: task.object,
            status,
        });
    }

    pub async fn running_tasks(&self) -> Vec<i64> {
        self.running.lock().await.keys().copied().collect()
    }
}
