//! Database layer for the control plane.
//!
//! This module provides SQLite persistence for:
//! - The prototype catalog (bundles, prototypes, actions, upgrades)
//! - Model objects and the host-component mapping
//! - Config roots and append-only config logs
//! - Concerns, tasks, jobs and job logs
//!
//! The module is organized into submodules:
//! - `records` - All record types (entities)
//! - `catalog` - Bundle and prototype storage
//! - `objects` - Objects, host-component rows, binds
//! - `configlog` - Config roots and config log rows
//! - `groups` - Config and action host groups
//! - `concerns` - Concern rows
//! - `tasks` - Tasks, jobs and log storage

mod catalog;
mod concerns;
mod configlog;
mod groups;
mod objects;
mod records;
mod tasks;

pub use records::*;

use anyhow::Result;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::constants::database as db_constants;

pub struct Database {
    pool: Pool<Sqlite>,
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| anyhow::anyhow!("Corrupt JSON column: {}", e))
}

pub(crate) fn from_json_opt<T: DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    match text {
        Some(text) => Ok(Some(from_json(&text)?)),
        None => Ok(None),
    }
}

impl Database {
    /// Expose pool for integration test queries
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn new(database_path: &str) -> Result<Self> {
        info!("=== Starting database initialization ===");
        info!("Database path: {}", database_path);

        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                info!("Ensuring parent directory exists: {:?}", parent);
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    error!("FAILED to create parent directory {:?}: {}", parent, e);
                    return Err(e.into());
                }
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", database_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(db_constants::BUSY_TIMEOUT_SECONDS));

        let pool = match SqlitePoolOptions::new()
            .max_connections(db_constants::MAX_CONNECTIONS)
            .connect_with(options)
            .await
        {
            Ok(pool) => {
                info!("Successfully connected to SQLite database");
                pool
            }
            Err(e) => {
                error!("FAILED to connect to database: {}", e);
                error!("   Database path: {}", database_path);
                return Err(e.into());
            }
        };

        let database = Self { pool };

        info!("Starting table initialization...");
        if let Err(e) = database.initialize_tables().await {
            error!("CRITICAL: Database table initialization failed: {}", e);
            return Err(e);
        }
        info!("Database tables initialized successfully");

        // Tasks left mid-flight by a previous process can never finish
        info!("Performing startup cleanup of stale tasks...");
        match database.mark_stale_tasks_broken().await {
            Ok(0) => info!("No stale tasks found"),
            Ok(count) => warn!("Marked {} stale tasks as BROKEN on startup", count),
            Err(e) => {
                error!("Failed to cleanup stale tasks: {}", e);
                warn!("Continuing with startup despite cleanup failure");
            }
        }

        info!("Testing database connectivity...");
        if let Err(e) = database.test_database().await {
            error!("Database test failed: {}", e);
            return Err(e);
        }

        info!("=== Database initialization completed successfully ===");
        Ok(database)
    }

    async fn run_ddl(&self, step: &str, sql: &str) -> Result<()> {
        info!("{}...", step);
        if let Err(e) = sqlx::query(sql).execute(&self.pool).await {
            error!("FAILED: {}: {}", step, e);
            error!("SQL was: {}", sql);
            return Err(e.into());
        }
        debug!("{} done", step);
        Ok(())
    }

    async fn initialize_tables(&self) -> Result<()> {
        self.run_ddl(
            "Step 1: Creating bundles table",
            r#"
            CREATE TABLE IF NOT EXISTS bundles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                edition TEXT NOT NULL,
                hash TEXT UNIQUE NOT NULL,
                license TEXT NOT NULL DEFAULT 'absent',
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 2: Creating prototypes table",
            r#"
            CREATE TABLE IF NOT EXISTS prototypes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bundle_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                name TEXT NOT NULL,
                display_name TEXT NOT NULL,
                version TEXT NOT NULL,
                parent_id INTEGER,
                spec TEXT NOT NULL
            )
            "#,
        )
        .await?;
        self.run_ddl(
            "Step 3: Creating prototypes index",
            "CREATE INDEX IF NOT EXISTS idx_prototypes_bundle ON prototypes(bundle_id, type, name)",
        )
        .await?;

        self.run_ddl(
            "Step 4: Creating actions table",
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prototype_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                upgrade_id INTEGER,
                spec TEXT NOT NULL
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 5: Creating upgrades table",
            r#"
            CREATE TABLE IF NOT EXISTS upgrades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bundle_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                action_id INTEGER,
                spec TEXT NOT NULL
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 6: Creating objects table",
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                object_type TEXT NOT NULL,
                prototype_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                parent_id INTEGER,
                cluster_id INTEGER,
                state TEXT NOT NULL DEFAULT 'created',
                multi_state TEXT NOT NULL DEFAULT '[]',
                config_root_id INTEGER,
                maintenance_mode TEXT NOT NULL DEFAULT 'off',
                before_upgrade TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .await?;
        self.run_ddl(
            "Step 7: Creating objects indexes",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_objects_unique_name ON objects(object_type, name) WHERE object_type IN ('cluster', 'provider', 'host')",
        )
        .await?;
        self.run_ddl(
            "Step 7b: Creating objects parent index",
            "CREATE INDEX IF NOT EXISTS idx_objects_parent ON objects(object_type, parent_id)",
        )
        .await?;

        self.run_ddl(
            "Step 8: Creating host_components table",
            r#"
            CREATE TABLE IF NOT EXISTS host_components (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id INTEGER NOT NULL,
                host_id INTEGER NOT NULL,
                service_id INTEGER NOT NULL,
                component_id INTEGER NOT NULL,
                UNIQUE(host_id, component_id)
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 9: Creating config_roots table",
            r#"
            CREATE TABLE IF NOT EXISTS config_roots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                current_id INTEGER,
                previous_id INTEGER
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 10: Creating config_logs table",
            r#"
            CREATE TABLE IF NOT EXISTS config_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_id INTEGER NOT NULL,
                config TEXT NOT NULL,
                attr TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .await?;
        self.run_ddl(
            "Step 11: Creating config_logs index",
            "CREATE INDEX IF NOT EXISTS idx_config_logs_root ON config_logs(root_id, id DESC)",
        )
        .await?;

        self.run_ddl(
            "Step 12: Creating host_groups table",
            r#"
            CREATE TABLE IF NOT EXISTS host_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                owner_type TEXT NOT NULL,
                owner_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                config_root_id INTEGER,
                UNIQUE(kind, owner_type, owner_id, name)
            )
            "#,
        )
        .await?;
        self.run_ddl(
            "Step 13: Creating host_group_members table",
            r#"
            CREATE TABLE IF NOT EXISTS host_group_members (
                group_id INTEGER NOT NULL,
                host_id INTEGER NOT NULL,
                PRIMARY KEY (group_id, host_id)
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 14: Creating binds table",
            r#"
            CREATE TABLE IF NOT EXISTS binds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id INTEGER NOT NULL,
                service_id INTEGER,
                source_type TEXT NOT NULL,
                source_id INTEGER NOT NULL
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 15: Creating concerns table",
            r#"
            CREATE TABLE IF NOT EXISTS concerns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                cause TEXT,
                name TEXT NOT NULL,
                owner_type TEXT NOT NULL,
                owner_id INTEGER NOT NULL,
                blocking BOOLEAN NOT NULL,
                reason TEXT NOT NULL,
                task_id INTEGER,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .await?;
        self.run_ddl(
            "Step 16: Creating concern uniqueness indexes",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_concerns_issue ON concerns(owner_type, owner_id, cause) WHERE type = 'issue'",
        )
        .await?;
        self.run_ddl(
            "Step 16b: Creating flag uniqueness index",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_concerns_flag ON concerns(owner_type, owner_id, name) WHERE type = 'flag'",
        )
        .await?;

        self.run_ddl(
            "Step 17: Creating tasks table",
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_id INTEGER NOT NULL,
                object_type TEXT NOT NULL,
                object_id INTEGER NOT NULL,
                target TEXT NOT NULL,
                config TEXT,
                attr TEXT NOT NULL,
                verbose BOOLEAN NOT NULL DEFAULT 0,
                hostcomponent TEXT,
                status TEXT NOT NULL,
                executor TEXT,
                selector TEXT NOT NULL,
                owner_user TEXT NOT NULL,
                start_date DATETIME,
                finish_date DATETIME,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .await?;
        self.run_ddl(
            "Step 18: Creating tasks status index",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, id)",
        )
        .await?;

        self.run_ddl(
            "Step 19: Creating jobs table",
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                start_date DATETIME,
                finish_date DATETIME,
                log_dir TEXT,
                token TEXT NOT NULL
            )
            "#,
        )
        .await?;

        self.run_ddl(
            "Step 20: Creating log_storage table",
            r#"
            CREATE TABLE IF NOT EXISTS log_storage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                format TEXT NOT NULL,
                body TEXT,
                file TEXT
            )
            "#,
        )
        .await?;

        info!("All database tables and indexes created successfully");
        Ok(())
    }

    /// Tasks in SCHEDULED/QUEUED/RUNNING belong to a dead process: mark them
    /// BROKEN, abort their unfinished jobs and drop their locks.
    async fn mark_stale_tasks_broken(&self) -> Result<u32> {
        let rows = sqlx::query(
            "SELECT id, status FROM tasks WHERE status IN ('scheduled', 'queued', 'running') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut cleaned = 0u32;

        for row in &rows {
            let task_id: i64 = row.try_get("id")?;
            let status: String = row.try_get("status")?;
            warn!("Task #{} was left in status {} - marking BROKEN", task_id, status);

            let mut tx = self.pool.begin().await?;
            sqlx::query("UPDATE tasks SET status = 'broken', finish_date = ? WHERE id = ?")
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE jobs SET status = 'aborted', finish_date = ? WHERE task_id = ? AND status IN ('created', 'running')",
            )
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM concerns WHERE type = 'lock' AND task_id = ?")
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            cleaned += 1;
        }

        Ok(cleaned)
    }

    async fn test_database(&self) -> Result<()> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('objects', 'tasks', 'concerns', 'config_logs')",
        )
        .fetch_all(&self.pool)
        .await?;

        if tables.len() != 4 {
            error!("Expected 4 core tables, found {}: {:?}", tables.len(), tables);
            return Err(anyhow::anyhow!("Database tables not properly created"));
        }
        debug!("Core tables exist: {:?}", tables);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initializes_and_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/conductor.db");
        let path = path.to_string_lossy().to_string();

        let db = Database::new(&path).await.unwrap();
        drop(db);
        // Second open must tolerate existing tables
        Database::new(&path).await.unwrap();
    }
}
