//! Concern rows.
//!
//! Uniqueness of issues per (owner, cause) and flags per (owner, name) is
//! enforced by partial unique indexes; inserts use `INSERT OR IGNORE`.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::records::{ConcernCause, ConcernRecord, ConcernType, NewConcern, ObjectRef, ObjectType};
use super::{from_json, to_json, Database};

fn concern_from_row(row: &SqliteRow) -> Result<ConcernRecord> {
    let concern_type: String = row.try_get("type")?;
    let cause: Option<String> = row.try_get("cause")?;
    let owner_type: String = row.try_get("owner_type")?;
    let reason: String = row.try_get("reason")?;
    Ok(ConcernRecord {
        id: row.try_get("id")?,
        concern_type: ConcernType::parse(&concern_type)?,
        cause: cause.as_deref().map(ConcernCause::parse).transpose()?,
        name: row.try_get("name")?,
        owner: ObjectRef::new(ObjectType::parse(&owner_type)?, row.try_get("owner_id")?),
        blocking: row.try_get("blocking")?,
        reason: from_json(&reason)?,
        task_id: row.try_get("task_id")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Database {
    /// Insert a concern; `None` when an equal issue or flag already exists
    pub async fn insert_concern(&self, concern: &NewConcern) -> Result<Option<i64>> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO concerns (
                type, cause, name, owner_type, owner_id, blocking, reason, task_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(concern.concern_type.as_str())
        .bind(concern.cause.map(|c| c.as_str()))
        .bind(&concern.name)
        .bind(concern.owner.object_type.as_str())
        .bind(concern.owner.id)
        .bind(concern.blocking)
        .bind(to_json(&concern.reason)?)
        .bind(concern.task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                "Concern {} '{}' on {} already present",
                concern.concern_type.as_str(),
                concern.name,
                concern.owner
            );
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    pub async fn list_concerns_owned_by(&self, owner: ObjectRef) -> Result<Vec<ConcernRecord>> {
        let rows = sqlx::query("SELECT * FROM concerns WHERE owner_type = ? AND owner_id = ? ORDER BY id")
            .bind(owner.object_type.as_str())
            .bind(owner.id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(concern_from_row).collect()
    }

    pub async fn list_all_concerns(&self) -> Result<Vec<ConcernRecord>> {
        let rows = sqlx::query("SELECT * FROM concerns ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(concern_from_row).collect()
    }

    pub async fn list_task_locks(&self, task_id: i64) -> Result<Vec<ConcernRecord>> {
        let rows = sqlx::query("SELECT * FROM concerns WHERE type = 'lock' AND task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(concern_from_row).collect()
    }

    pub async fn delete_concern(&self, concern_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM concerns WHERE id = ?")
            .bind(concern_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_issue(&self, owner: ObjectRef, cause: ConcernCause) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM concerns WHERE type = 'issue' AND owner_type = ? AND owner_id = ? AND cause = ?",
        )
        .bind(owner.object_type.as_str())
        .bind(owner.id)
        .bind(cause.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
