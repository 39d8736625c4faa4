//! Model objects, host-component rows and binds.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::records::{
    BindRecord, HcEntry, MaintenanceMode, NewObject, ObjectRecord, ObjectRef, ObjectType,
};
use super::{from_json, from_json_opt, to_json, Database};
use crate::errors::ConductorError;

fn object_from_row(row: &SqliteRow) -> Result<ObjectRecord> {
    let object_type: String = row.try_get("object_type")?;
    let multi_state: String = row.try_get("multi_state")?;
    let maintenance_mode: String = row.try_get("maintenance_mode")?;
    Ok(ObjectRecord {
        id: row.try_get("id")?,
        object_type: ObjectType::parse(&object_type)?,
        prototype_id: row.try_get("prototype_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        parent_id: row.try_get("parent_id")?,
        cluster_id: row.try_get("cluster_id")?,
        state: row.try_get("state")?,
        multi_state: from_json(&multi_state)?,
        config_root_id: row.try_get("config_root_id")?,
        maintenance_mode: MaintenanceMode::parse(&maintenance_mode)?,
        before_upgrade: from_json_opt(row.try_get("before_upgrade")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn hc_from_row(row: &SqliteRow) -> Result<HcEntry> {
    Ok(HcEntry {
        host_id: row.try_get("host_id")?,
        service_id: row.try_get("service_id")?,
        component_id: row.try_get("component_id")?,
    })
}

fn bind_from_row(row: &SqliteRow) -> Result<BindRecord> {
    let source_type: String = row.try_get("source_type")?;
    Ok(BindRecord {
        id: row.try_get("id")?,
        cluster_id: row.try_get("cluster_id")?,
        service_id: row.try_get("service_id")?,
        source: ObjectRef::new(ObjectType::parse(&source_type)?, row.try_get("source_id")?),
    })
}

impl Database {
    // ========================================================================
    // Objects
    // ========================================================================

    pub async fn insert_object(&self, object: &NewObject) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO objects (
                object_type, prototype_id, name, description, parent_id, cluster_id,
                state, multi_state, config_root_id, maintenance_mode, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'created', '[]', ?, 'off', ?)
            "#,
        )
        .bind(object.object_type.as_str())
        .bind(object.prototype_id)
        .bind(&object.name)
        .bind(&object.description)
        .bind(object.parent_id)
        .bind(object.cluster_id)
        .bind(object.config_root_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                info!("Created {} '{}' (#{})", object.object_type, object.name, id);
                Ok(id)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(ConductorError::NameConflict {
                    kind: object.object_type.to_string(),
                    name: object.name.clone(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_object(&self, object: ObjectRef) -> Result<Option<ObjectRecord>> {
        let row = sqlx::query("SELECT * FROM objects WHERE id = ? AND object_type = ?")
            .bind(object.id)
            .bind(object.object_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    /// Like `get_object` but a missing row is an `OBJECT_NOT_FOUND` error
    pub async fn require_object(&self, object: ObjectRef) -> Result<ObjectRecord> {
        self.get_object(object).await?.ok_or_else(|| {
            ConductorError::ObjectNotFound {
                object: object.to_string(),
            }
            .into()
        })
    }

    pub async fn find_object_by_name(
        &self,
        object_type: ObjectType,
        name: &str,
    ) -> Result<Option<ObjectRecord>> {
        let row = sqlx::query("SELECT * FROM objects WHERE object_type = ? AND name = ?")
            .bind(object_type.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    /// Services of a cluster, components of a service, hosts of a provider
    pub async fn list_children(
        &self,
        object_type: ObjectType,
        parent_id: i64,
    ) -> Result<Vec<ObjectRecord>> {
        let rows = sqlx::query("SELECT * FROM objects WHERE object_type = ? AND parent_id = ? ORDER BY id")
            .bind(object_type.as_str())
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(object_from_row).collect()
    }

    /// Objects of a type that belong to (or are attached to) a cluster
    pub async fn list_in_cluster(
        &self,
        object_type: ObjectType,
        cluster_id: i64,
    ) -> Result<Vec<ObjectRecord>> {
        let rows = sqlx::query("SELECT * FROM objects WHERE object_type = ? AND cluster_id = ? ORDER BY id")
            .bind(object_type.as_str())
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(object_from_row).collect()
    }

    pub async fn list_objects(&self, object_type: ObjectType) -> Result<Vec<ObjectRecord>> {
        let rows = sqlx::query("SELECT * FROM objects WHERE object_type = ? ORDER BY id")
            .bind(object_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(object_from_row).collect()
    }

    pub async fn update_state(&self, object: ObjectRef, state: &str) -> Result<()> {
        sqlx::query("UPDATE objects SET state = ? WHERE id = ? AND object_type = ?")
            .bind(state)
            .bind(object.id)
            .bind(object.object_type.as_str())
            .execute(&self.pool)
            .await?;
        debug!("{} state -> {}", object, state);
        Ok(())
    }

    pub async fn update_multi_state(
        &self,
        object: ObjectRef,
        multi_state: &BTreeSet<String>,
    ) -> Result<()> {
        sqlx::query("UPDATE objects SET multi_state = ? WHERE id = ? AND object_type = ?")
            .bind(to_json(multi_state)?)
            .bind(object.id)
            .bind(object.object_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_maintenance_mode(
        &self,
        object: ObjectRef,
        mode: MaintenanceMode,
    ) -> Result<()> {
        sqlx::query("UPDATE objects SET maintenance_mode = ? WHERE id = ? AND object_type = ?")
            .bind(mode.as_str())
            .bind(object.id)
            .bind(object.object_type.as_str())
            .execute(&self.pool)
            .await?;
        info!("{} maintenance mode -> {}", object, mode.as_str());
        Ok(())
    }

    pub async fn set_host_cluster(&self, host_id: i64, cluster_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE objects SET cluster_id = ? WHERE id = ? AND object_type = 'host'")
            .bind(cluster_id)
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_prototype(&self, object: ObjectRef, prototype_id: i64) -> Result<()> {
        sqlx::query("UPDATE objects SET prototype_id = ? WHERE id = ? AND object_type = ?")
            .bind(prototype_id)
            .bind(object.id)
            .bind(object.object_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_before_upgrade(
        &self,
        object: ObjectRef,
        before_upgrade: Option<&serde_json::Value>,
    ) -> Result<()> {
        let value = before_upgrade.map(to_json).transpose()?;
        sqlx::query("UPDATE objects SET before_upgrade = ? WHERE id = ? AND object_type = ?")
            .bind(value)
            .bind(object.id)
            .bind(object.object_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_config_root(&self, object: ObjectRef, root_id: i64) -> Result<()> {
        sqlx::query("UPDATE objects SET config_root_id = ? WHERE id = ? AND object_type = ?")
            .bind(root_id)
            .bind(object.id)
            .bind(object.object_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove an object row along with rows that only make sense with it
    pub async fn delete_object(&self, object: ObjectRef) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let column = match object.object_type {
            ObjectType::Host => Some("host_id"),
            ObjectType::Service => Some("service_id"),
            ObjectType::Component => Some("component_id"),
            ObjectType::Cluster => Some("cluster_id"),
            _ => None,
        };
        if let Some(column) = column {
            sqlx::query(&format!("DELETE FROM host_components WHERE {} = ?", column))
                .bind(object.id)
                .execute(&mut *tx)
                .await?;
        }
        if object.object_type == ObjectType::Host {
            sqlx::query("DELETE FROM host_group_members WHERE host_id = ?")
                .bind(object.id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM binds WHERE (source_type = ? AND source_id = ?) OR (? = 'cluster' AND cluster_id = ?) OR (? = 'service' AND service_id = ?)")
            .bind(object.object_type.as_str())
            .bind(object.id)
            .bind(object.object_type.as_str())
            .bind(object.id)
            .bind(object.object_type.as_str())
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM concerns WHERE owner_type = ? AND owner_id = ? AND type != 'lock'")
            .bind(object.object_type.as_str())
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM objects WHERE id = ? AND object_type = ?")
            .bind(object.id)
            .bind(object.object_type.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("Deleted {}", object);
        Ok(())
    }

    // ========================================================================
    // Host-component mapping
    // ========================================================================

    pub async fn get_hostcomponents(&self, cluster_id: i64) -> Result<BTreeSet<HcEntry>> {
        let rows = sqlx::query(
            "SELECT host_id, service_id, component_id FROM host_components WHERE cluster_id = ?",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(hc_from_row).collect()
    }

    pub async fn list_all_hostcomponents(&self) -> Result<Vec<(i64, HcEntry)>> {
        let rows = sqlx::query(
            "SELECT cluster_id, host_id, service_id, component_id FROM host_components ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("cluster_id")?, hc_from_row(row)?)))
            .collect()
    }

    /// Swap the whole cluster mapping in one transaction
    pub async fn replace_hostcomponents(
        &self,
        cluster_id: i64,
        desired: &BTreeSet<HcEntry>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM host_components WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;

        for entry in desired {
            sqlx::query(
                "INSERT INTO host_components (cluster_id, host_id, service_id, component_id) VALUES (?, ?, ?, ?)",
            )
            .bind(cluster_id)
            .bind(entry.host_id)
            .bind(entry.service_id)
            .bind(entry.component_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            "Cluster #{} mapping replaced with {} entries",
            cluster_id,
            desired.len()
        );
        Ok(())
    }

    pub async fn host_is_mapped(&self, host_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM host_components WHERE host_id = ?")
            .bind(host_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    // ========================================================================
    // Binds
    // ========================================================================

    pub async fn insert_bind(
        &self,
        cluster_id: i64,
        service_id: Option<i64>,
        source: ObjectRef,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO binds (cluster_id, service_id, source_type, source_id) VALUES (?, ?, ?, ?)",
        )
        .bind(cluster_id)
        .bind(service_id)
        .bind(source.object_type.as_str())
        .bind(source.id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn delete_bind(&self, bind_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM binds WHERE id = ?")
            .bind(bind_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_binds(&self, cluster_id: i64) -> Result<Vec<BindRecord>> {
        let rows = sqlx::query("SELECT * FROM binds WHERE cluster_id = ? ORDER BY id")
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(bind_from_row).collect()
    }
}
