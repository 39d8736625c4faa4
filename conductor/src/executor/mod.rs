//! Job runner contract.
//!
//! A job goes through `prepare` (work dir with `config.json`, `inventory.json`
//! and secret files), `execute` on a [`JobExecutor`], `collect_logs` and
//! `cleanup`. Internal scripts never reach an executor; they run in-process
//! through [`internal::InternalScripts`].

pub mod internal;
pub mod local;
pub mod remote;
pub mod workdir;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{Config, ExecutionEnvironment};
use crate::database::{JobRecord, JobStatus, TaskRecord};

pub use internal::InternalScripts;
pub use local::LocalExecutor;
pub use remote::RemoteExecutor;
pub use workdir::JobPreparer;

/// A job whose work dir has been materialized
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub job: JobRecord,
    pub task: TaskRecord,
    pub work_dir: PathBuf,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            status: JobStatus::Success,
            exit_code: Some(0),
        }
    }

    pub fn failed(exit_code: Option<i32>) -> Self {
        Self {
            status: JobStatus::Failed,
            exit_code,
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: JobStatus::Aborted,
            exit_code: None,
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn environment(&self) -> ExecutionEnvironment;

    /// Identifies this worker in the task's executor descriptor
    fn worker_id(&self) -> String;

    /// Run the prepared command until it exits or `cancel` turns true
    async fn execute(&self, job: &PreparedJob, cancel: watch::Receiver<bool>) -> Result<JobOutcome>;

    /// Whether the worker still knows about a RUNNING job
    async fn is_alive(&self, job: &JobRecord) -> Result<bool>;
}

/// Executor for the configured default environment
pub fn from_config(settings: &Config) -> Result<Arc<dyn JobExecutor>> {
    match settings.executor.default_environment {
        ExecutionEnvironment::Local => Ok(Arc::new(LocalExecutor::new())),
        ExecutionEnvironment::Celery => Ok(Arc::new(RemoteExecutor::new(&settings.executor)?)),
    }
}

/// Resolves once `cancel` carries `true`; never resolves if the sender is gone
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_follows_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(cancelled(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sender_is_not_a_cancel() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_millis(50), cancelled(rx)).await;
        assert!(result.is_err());
    }
}
