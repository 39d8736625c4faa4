//! Job executor that never spawns anything.
//!
//! Writes a stdout log into the work dir, optionally waits on a gate so a
//! test can act while the job is RUNNING, and returns queued outcomes
//! (success when the queue is empty).

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use conductor::config::ExecutionEnvironment;
use conductor::database::{JobRecord, LogType};
use conductor::executor::workdir::log_file;
use conductor::executor::{JobExecutor, JobOutcome, PreparedJob};

pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<JobOutcome>>,
    gate: watch::Sender<bool>,
    started: Mutex<Vec<PreparedJob>>,
    alive: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            gate,
            started: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        }
    }

    /// Jobs started from now on wait until `release`
    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    pub fn push_outcome(&self, outcome: JobOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<PreparedJob> {
        self.started.lock().unwrap().clone()
    }

    /// Wait until `count` jobs have reached the executor
    pub async fn wait_started(&self, count: usize) -> Vec<PreparedJob> {
        for _ in 0..200 {
            let started = self.started();
            if started.len() >= count {
                return started;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("only {} jobs started, expected {}", self.started().len(), count);
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    fn environment(&self) -> ExecutionEnvironment {
        ExecutionEnvironment::Local
    }

    fn worker_id(&self) -> String {
        "scripted".to_string()
    }

    async fn execute(&self, job: &PreparedJob, mut cancel: watch::Receiver<bool>) -> Result<JobOutcome> {
        let stdout = log_file(&job.work_dir, job.job.spec.script_type, LogType::Stdout);
        tokio::fs::write(&stdout, format!("ran {}\n", job.job.name)).await?;
        self.started.lock().unwrap().push(job.clone());

        let mut gate = self.gate.subscribe();
        while *gate.borrow_and_update() {
            tokio::select! {
                _ = gate.changed() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Ok(JobOutcome::aborted());
                    }
                }
            }
        }

        let outcome = self.outcomes.lock().unwrap().pop_front();
        Ok(outcome.unwrap_or_else(JobOutcome::success))
    }

    async fn is_alive(&self, _job: &JobRecord) -> Result<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }
}
