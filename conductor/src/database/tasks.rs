//! Tasks, jobs and log storage.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

use super::records::{
    ExecutorDescriptor, JobRecord, JobStatus, LogFormat, LogRecord, LogType, NewLog, NewTask,
    ObjectRef, ObjectType, TaskRecord, TaskStatus,
};
use super::{from_json, from_json_opt, to_json, Database};
use crate::catalog::definition::SubactionSpec;

const TERMINAL_STATUSES: &str = "('success', 'failed', 'aborted', 'broken', 'revoked')";

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord> {
    let object_type: String = row.try_get("object_type")?;
    let target: String = row.try_get("target")?;
    let attr: String = row.try_get("attr")?;
    let status: String = row.try_get("status")?;
    let selector: String = row.try_get("selector")?;
    Ok(TaskRecord {
        id: row.try_get("id")?,
        action_id: row.try_get("action_id")?,
        object: ObjectRef::new(ObjectType::parse(&object_type)?, row.try_get("object_id")?),
        target: from_json(&target)?,
        config: from_json_opt(row.try_get("config")?)?,
        attr: from_json(&attr)?,
        verbose: row.try_get("verbose")?,
        hostcomponent: from_json_opt(row.try_get("hostcomponent")?)?,
        status: TaskStatus::parse(&status)?,
        executor: from_json_opt(row.try_get("executor")?)?,
        selector: from_json(&selector)?,
        owner_user: row.try_get("owner_user")?,
        start_date: row.try_get("start_date")?,
        finish_date: row.try_get("finish_date")?,
        created_at: row.try_get("created_at")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let spec: String = row.try_get("spec")?;
    let status: String = row.try_get("status")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        position: row.try_get("position")?,
        name: row.try_get("name")?,
        spec: from_json(&spec)?,
        status: JobStatus::parse(&status)?,
        start_date: row.try_get("start_date")?,
        finish_date: row.try_get("finish_date")?,
        log_dir: row.try_get("log_dir")?,
        token: row.try_get("token")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<LogRecord> {
    let log_type: String = row.try_get("type")?;
    let format: String = row.try_get("format")?;
    Ok(LogRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        name: row.try_get("name")?,
        log_type: LogType::parse(&log_type)?,
        format: LogFormat::parse(&format)?,
        body: row.try_get("body")?,
        file: row.try_get("file")?,
    })
}

impl Database {
    // ========================================================================
    // Tasks
    // ========================================================================

    /// Persist a CREATED task and its ordered jobs atomically
    pub async fn create_task(&self, task: &NewTask, jobs: &[SubactionSpec]) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let task_id = sqlx::query(
            r#"
            INSERT INTO tasks (
                action_id, object_type, object_id, target, config, attr, verbose,
                hostcomponent, status, executor, selector, owner_user, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'created', NULL, ?, ?, ?)
            "#,
        )
        .bind(task.action_id)
        .bind(task.object.object_type.as_str())
        .bind(task.object.id)
        .bind(to_json(&task.target)?)
        .bind(task.config.as_ref().map(to_json).transpose()?)
        .bind(to_json(&task.attr)?)
        .bind(task.verbose)
        .bind(task.hostcomponent.as_ref().map(to_json).transpose()?)
        .bind(to_json(&task.selector)?)
        .bind(&task.owner_user)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (position, spec) in jobs.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO jobs (task_id, position, name, spec, status, token)
                VALUES (?, ?, ?, ?, 'created', ?)
                "#,
            )
            .bind(task_id)
            .bind(position as i64)
            .bind(&spec.name)
            .bind(to_json(spec)?)
            .bind(uuid::Uuid::new_v4().to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!("Task #{} created on {} with {} jobs", task_id, task.object, jobs.len());
        Ok(task_id)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Atomically move the oldest CREATED task to SCHEDULED.
    ///
    /// The conditional UPDATE is the single-writer guard: of several
    /// schedulers racing on one row only the one that flips it wins.
    pub async fn claim_next_created_task(&self) -> Result<Option<TaskRecord>> {
        loop {
            let candidate: Option<i64> =
                sqlx::query_scalar("SELECT id FROM tasks WHERE status = 'created' ORDER BY id LIMIT 1")
                    .fetch_optional(&self.pool)
                    .await?;

            let Some(task_id) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                "UPDATE tasks SET status = 'scheduled' WHERE id = ? AND status = 'created'",
            )
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if claimed == 1 {
                debug!("Claimed task #{}", task_id);
                return self.get_task(task_id).await;
            }
        }
    }

    /// Move a task to `status`. Terminal statuses are sticky: returns false
    /// when the task had already finished.
    pub async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<bool> {
        let date_column = match status {
            TaskStatus::Running => Some("start_date"),
            s if s.is_terminal() => Some("finish_date"),
            _ => None,
        };

        let affected = match date_column {
            Some(column) => sqlx::query(&format!(
                "UPDATE tasks SET status = ?, {} = ? WHERE id = ? AND status NOT IN {}",
                column, TERMINAL_STATUSES
            ))
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            None => sqlx::query(&format!(
                "UPDATE tasks SET status = ? WHERE id = ? AND status NOT IN {}",
                TERMINAL_STATUSES
            ))
            .bind(status.as_str())
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected(),
        };

        if affected == 1 {
            info!("Task #{} -> {}", task_id, status);
        }
        Ok(affected == 1)
    }

    pub async fn set_task_executor(&self, task_id: i64, executor: &ExecutorDescriptor) -> Result<()> {
        sqlx::query("UPDATE tasks SET executor = ? WHERE id = ?")
            .bind(to_json(executor)?)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn list_jobs(&self, task_id: i64) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE task_id = ? ORDER BY position")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn update_job_status(&self, job_id: i64, status: JobStatus) -> Result<()> {
        let now = Utc::now();
        match status {
            JobStatus::Running => {
                sqlx::query("UPDATE jobs SET status = ?, start_date = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(now)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
            }
            JobStatus::Created => {
                sqlx::query("UPDATE jobs SET status = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
            }
            _ => {
                sqlx::query("UPDATE jobs SET status = ?, finish_date = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(now)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        info!("Job #{} -> {}", job_id, status);
        Ok(())
    }

    /// Mark every job still CREATED or RUNNING as ABORTED
    pub async fn abort_unfinished_jobs(&self, task_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'aborted', finish_date = ? WHERE task_id = ? AND status IN ('created', 'running')",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_job_log_dir(&self, job_id: i64, log_dir: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET log_dir = ? WHERE id = ?")
            .bind(log_dir)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Log storage
    // ========================================================================

    pub async fn insert_log(&self, job_id: i64, log: &NewLog) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO log_storage (job_id, name, type, format, body, file) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(&log.name)
        .bind(log.log_type.as_str())
        .bind(log.format.as_str())
        .bind(&log.body)
        .bind(&log.file)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_logs(&self, job_id: i64) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query("SELECT * FROM log_storage WHERE job_id = ? ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    pub async fn find_log(
        &self,
        job_id: i64,
        name: &str,
        log_type: LogType,
    ) -> Result<Option<LogRecord>> {
        let row = sqlx::query("SELECT * FROM log_storage WHERE job_id = ? AND name = ? AND type = ?")
            .bind(job_id)
            .bind(name)
            .bind(log_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    pub async fn update_log_body(&self, log_id: i64, body: &str) -> Result<()> {
        sqlx::query("UPDATE log_storage SET body = ? WHERE id = ?")
            .bind(body)
            .bind(log_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
