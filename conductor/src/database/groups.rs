//! Config host groups and action host groups.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;

use super::records::{HostGroupKind, HostGroupRecord, ObjectRef, ObjectType};
use super::Database;
use crate::errors::ConductorError;

fn kind_from_str(value: &str) -> Result<HostGroupKind> {
    match value {
        "config" => Ok(HostGroupKind::Config),
        "action" => Ok(HostGroupKind::Action),
        other => Err(anyhow::anyhow!("Unknown host group kind: {}", other)),
    }
}

impl Database {
    async fn group_from_row(&self, row: &SqliteRow) -> Result<HostGroupRecord> {
        let id: i64 = row.try_get("id")?;
        let kind: String = row.try_get("kind")?;
        let owner_type: String = row.try_get("owner_type")?;
        let hosts: Vec<i64> = sqlx::query_scalar(
            "SELECT host_id FROM host_group_members WHERE group_id = ? ORDER BY host_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(HostGroupRecord {
            id,
            kind: kind_from_str(&kind)?,
            owner: ObjectRef::new(ObjectType::parse(&owner_type)?, row.try_get("owner_id")?),
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            config_root_id: row.try_get("config_root_id")?,
            hosts,
        })
    }

    pub async fn create_host_group(
        &self,
        kind: HostGroupKind,
        owner: ObjectRef,
        name: &str,
        description: &str,
        config_root_id: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO host_groups (kind, owner_type, owner_id, name, description, config_root_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(kind.as_str())
        .bind(owner.object_type.as_str())
        .bind(owner.id)
        .bind(name)
        .bind(description)
        .bind(config_root_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                info!("Created {} host group '{}' on {} (#{})", kind.as_str(), name, owner, id);
                Ok(id)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(ConductorError::NameConflict {
                    kind: format!("{} host group", kind.as_str()),
                    name: name.to_string(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_host_group(&self, group_id: i64) -> Result<Option<HostGroupRecord>> {
        let row = sqlx::query("SELECT * FROM host_groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.group_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_host_groups(
        &self,
        kind: HostGroupKind,
        owner: ObjectRef,
    ) -> Result<Vec<HostGroupRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM host_groups WHERE kind = ? AND owner_type = ? AND owner_id = ? ORDER BY id",
        )
        .bind(kind.as_str())
        .bind(owner.object_type.as_str())
        .bind(owner.id)
        .fetch_all(&self.pool)
        .await?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in &rows {
            groups.push(self.group_from_row(row).await?);
        }
        Ok(groups)
    }

    /// Config host groups a host participates in
    pub async fn list_config_groups_for_host(&self, host_id: i64) -> Result<Vec<HostGroupRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT g.* FROM host_groups g
            JOIN host_group_members m ON m.group_id = g.id
            WHERE g.kind = 'config' AND m.host_id = ?
            ORDER BY g.id
            "#,
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in &rows {
            groups.push(self.group_from_row(row).await?);
        }
        Ok(groups)
    }

    pub async fn add_host_to_group(&self, group_id: i64, host_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO host_group_members (group_id, host_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_host_from_group(&self, group_id: i64, host_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM host_group_members WHERE group_id = ? AND host_id = ?")
            .bind(group_id)
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop memberships of hosts that are no longer part of a cluster
    pub async fn remove_host_from_all_groups(&self, host_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM host_group_members WHERE host_id = ?")
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_host_group(&self, group_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM host_group_members WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM host_groups WHERE id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
