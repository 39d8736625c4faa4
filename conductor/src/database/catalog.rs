//! Bundle, prototype, action and upgrade storage.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use super::records::{ActionRecord, BundleRecord, PrototypeRecord, UpgradeRecord};
use super::{from_json, to_json, Database};
use crate::catalog::definition::{
    ActionSpec, BundleDefinition, PrototypeSpec, PrototypeType,
};

fn bundle_from_row(row: &SqliteRow) -> Result<BundleRecord> {
    Ok(BundleRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        edition: row.try_get("edition")?,
        hash: row.try_get("hash")?,
        license: row.try_get("license")?,
        created_at: row.try_get("created_at")?,
    })
}

fn prototype_from_row(row: &SqliteRow) -> Result<PrototypeRecord> {
    let prototype_type: String = row.try_get("type")?;
    let spec: String = row.try_get("spec")?;
    Ok(PrototypeRecord {
        id: row.try_get("id")?,
        bundle_id: row.try_get("bundle_id")?,
        prototype_type: PrototypeType::parse(&prototype_type)?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        version: row.try_get("version")?,
        parent_id: row.try_get("parent_id")?,
        spec: from_json(&spec)?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<ActionRecord> {
    let spec: String = row.try_get("spec")?;
    Ok(ActionRecord {
        id: row.try_get("id")?,
        prototype_id: row.try_get("prototype_id")?,
        name: row.try_get("name")?,
        upgrade_id: row.try_get("upgrade_id")?,
        spec: from_json(&spec)?,
    })
}

fn upgrade_from_row(row: &SqliteRow) -> Result<UpgradeRecord> {
    let spec: String = row.try_get("spec")?;
    Ok(UpgradeRecord {
        id: row.try_get("id")?,
        bundle_id: row.try_get("bundle_id")?,
        name: row.try_get("name")?,
        action_id: row.try_get("action_id")?,
        spec: from_json(&spec)?,
    })
}

#[allow(clippy::too_many_arguments)]
async fn insert_prototype(
    tx: &mut Transaction<'_, Sqlite>,
    bundle_id: i64,
    prototype_type: PrototypeType,
    name: &str,
    display_name: &str,
    version: &str,
    parent_id: Option<i64>,
    spec: &PrototypeSpec,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO prototypes (bundle_id, type, name, display_name, version, parent_id, spec)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(bundle_id)
    .bind(prototype_type.as_str())
    .bind(name)
    .bind(display_name)
    .bind(version)
    .bind(parent_id)
    .bind(to_json(spec)?)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn insert_action(
    tx: &mut Transaction<'_, Sqlite>,
    prototype_id: i64,
    name: &str,
    upgrade_id: Option<i64>,
    spec: &ActionSpec,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO actions (prototype_id, name, upgrade_id, spec) VALUES (?, ?, ?, ?)",
    )
    .bind(prototype_id)
    .bind(name)
    .bind(upgrade_id)
    .bind(to_json(spec)?)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

impl Database {
    pub async fn find_bundle_by_hash(&self, hash: &str) -> Result<Option<BundleRecord>> {
        let row = sqlx::query("SELECT * FROM bundles WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bundle_from_row).transpose()
    }

    pub async fn get_bundle(&self, bundle_id: i64) -> Result<Option<BundleRecord>> {
        let row = sqlx::query("SELECT * FROM bundles WHERE id = ?")
            .bind(bundle_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bundle_from_row).transpose()
    }

    /// Write a validated bundle and everything it declares in one transaction
    pub async fn store_bundle(&self, bundle: &BundleDefinition) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let bundle_id = sqlx::query(
            r#"
            INSERT INTO bundles (name, version, edition, hash, license, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(bundle.name())
        .bind(bundle.version())
        .bind(bundle.edition())
        .bind(&bundle.hash)
        .bind(
            if bundle
                .main_prototype()
                .and_then(|p| p.license.as_ref())
                .is_some()
            {
                "unaccepted"
            } else {
                "absent"
            },
        )
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut main_prototype_id = None;

        for proto in &bundle.prototypes {
            let display_name = proto.display_name.clone().unwrap_or_else(|| proto.name.clone());
            let prototype_id = insert_prototype(
                &mut tx,
                bundle_id,
                proto.prototype_type,
                &proto.name,
                &display_name,
                &proto.version,
                None,
                &proto.spec,
            )
            .await?;
            debug!("Stored prototype {} '{}' as #{}", proto.prototype_type, proto.name, prototype_id);

            if matches!(proto.prototype_type, PrototypeType::Cluster | PrototypeType::Provider) {
                main_prototype_id = Some(prototype_id);
            }

            for (action_name, action) in &proto.actions {
                insert_action(&mut tx, prototype_id, action_name, None, action).await?;
            }

            for (component_name, component) in &proto.components {
                let display_name = component
                    .display_name
                    .clone()
                    .unwrap_or_else(|| component_name.clone());
                let component_id = insert_prototype(
                    &mut tx,
                    bundle_id,
                    PrototypeType::Component,
                    component_name,
                    &display_name,
                    &proto.version,
                    Some(prototype_id),
                    &component.spec,
                )
                .await?;
                for (action_name, action) in &component.actions {
                    insert_action(&mut tx, component_id, action_name, None, action).await?;
                }
            }
        }

        for proto in &bundle.prototypes {
            for upgrade in &proto.upgrade {
                let upgrade_id = sqlx::query(
                    "INSERT INTO upgrades (bundle_id, name, action_id, spec) VALUES (?, ?, NULL, ?)",
                )
                .bind(bundle_id)
                .bind(&upgrade.name)
                .bind(to_json(upgrade)?)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

                if let (false, Some(owner)) = (upgrade.scripts.is_empty(), main_prototype_id) {
                    let action_name = format!("upgrade_{}", upgrade.name);
                    let action_id = insert_action(
                        &mut tx,
                        owner,
                        &action_name,
                        Some(upgrade_id),
                        &upgrade.to_action_spec(),
                    )
                    .await?;
                    sqlx::query("UPDATE upgrades SET action_id = ? WHERE id = ?")
                        .bind(action_id)
                        .bind(upgrade_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        info!(
            "Stored bundle {} {} (#{}, hash {})",
            bundle.name(),
            bundle.version(),
            bundle_id,
            bundle.hash
        );
        Ok(bundle_id)
    }

    pub async fn get_prototype(&self, prototype_id: i64) -> Result<Option<PrototypeRecord>> {
        let row = sqlx::query("SELECT * FROM prototypes WHERE id = ?")
            .bind(prototype_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(prototype_from_row).transpose()
    }

    pub async fn find_prototype(
        &self,
        bundle_id: i64,
        prototype_type: PrototypeType,
        name: &str,
        parent_id: Option<i64>,
    ) -> Result<Option<PrototypeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM prototypes
            WHERE bundle_id = ? AND type = ? AND name = ? AND parent_id IS ?
            "#,
        )
        .bind(bundle_id)
        .bind(prototype_type.as_str())
        .bind(name)
        .bind(parent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(prototype_from_row).transpose()
    }

    pub async fn list_prototypes(&self, bundle_id: i64) -> Result<Vec<PrototypeRecord>> {
        let rows = sqlx::query("SELECT * FROM prototypes WHERE bundle_id = ? ORDER BY id")
            .bind(bundle_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prototype_from_row).collect()
    }

    pub async fn list_child_prototypes(&self, parent_id: i64) -> Result<Vec<PrototypeRecord>> {
        let rows = sqlx::query("SELECT * FROM prototypes WHERE parent_id = ? ORDER BY id")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prototype_from_row).collect()
    }

    pub async fn list_actions(&self, prototype_id: i64) -> Result<Vec<ActionRecord>> {
        let rows = sqlx::query("SELECT * FROM actions WHERE prototype_id = ? ORDER BY id")
            .bind(prototype_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(action_from_row).collect()
    }

    pub async fn get_action(&self, action_id: i64) -> Result<Option<ActionRecord>> {
        let row = sqlx::query("SELECT * FROM actions WHERE id = ?")
            .bind(action_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(action_from_row).transpose()
    }

    pub async fn list_upgrades(&self, bundle_id: i64) -> Result<Vec<UpgradeRecord>> {
        let rows = sqlx::query("SELECT * FROM upgrades WHERE bundle_id = ? ORDER BY id")
            .bind(bundle_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(upgrade_from_row).collect()
    }

    pub async fn list_all_upgrades(&self) -> Result<Vec<UpgradeRecord>> {
        let rows = sqlx::query("SELECT * FROM upgrades ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(upgrade_from_row).collect()
    }

    pub async fn get_upgrade(&self, upgrade_id: i64) -> Result<Option<UpgradeRecord>> {
        let row = sqlx::query("SELECT * FROM upgrades WHERE id = ?")
            .bind(upgrade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(upgrade_from_row).transpose()
    }
}
