//! Config roots and append-only config log rows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::records::ConfigLogRecord;
use super::{from_json, to_json, Database};

fn log_from_row(row: &SqliteRow) -> Result<ConfigLogRecord> {
    let config: String = row.try_get("config")?;
    let attr: String = row.try_get("attr")?;
    Ok(ConfigLogRecord {
        id: row.try_get("id")?,
        root_id: row.try_get("root_id")?,
        config: from_json(&config)?,
        attr: from_json(&attr)?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Database {
    /// Create a root with its first log row; returns (root_id, log_id)
    pub async fn create_config_root(
        &self,
        config: &serde_json::Value,
        attr: &serde_json::Value,
        description: &str,
    ) -> Result<(i64, i64)> {
        let mut tx = self.pool.begin().await?;

        let root_id = sqlx::query("INSERT INTO config_roots (current_id, previous_id) VALUES (NULL, NULL)")
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let log_id = sqlx::query(
            "INSERT INTO config_logs (root_id, config, attr, description, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(root_id)
        .bind(to_json(config)?)
        .bind(to_json(attr)?)
        .bind(description)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE config_roots SET current_id = ? WHERE id = ?")
            .bind(log_id)
            .bind(root_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Created config root #{} with log #{}", root_id, log_id);
        Ok((root_id, log_id))
    }

    /// Append a log row and advance `current`, moving the old one to `previous`
    pub async fn append_config_log(
        &self,
        root_id: i64,
        config: &serde_json::Value,
        attr: &serde_json::Value,
        description: &str,
    ) -> Result<ConfigLogRecord> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // Touch the root first so the write lock is held before reading current
        sqlx::query("UPDATE config_roots SET previous_id = current_id WHERE id = ?")
            .bind(root_id)
            .execute(&mut *tx)
            .await?;

        let log_id = sqlx::query(
            "INSERT INTO config_logs (root_id, config, attr, description, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(root_id)
        .bind(to_json(config)?)
        .bind(to_json(attr)?)
        .bind(description)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE config_roots SET current_id = ? WHERE id = ?")
            .bind(log_id)
            .bind(root_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Config root #{} advanced to log #{}", root_id, log_id);

        Ok(ConfigLogRecord {
            id: log_id,
            root_id,
            config: config.clone(),
            attr: attr.clone(),
            description: description.to_string(),
            created_at: now,
        })
    }

    pub async fn get_config_log(&self, log_id: i64) -> Result<Option<ConfigLogRecord>> {
        let row = sqlx::query("SELECT * FROM config_logs WHERE id = ?")
            .bind(log_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    pub async fn current_config_log(&self, root_id: i64) -> Result<Option<ConfigLogRecord>> {
        let row = sqlx::query(
            r#"
            SELECT l.* FROM config_logs l
            JOIN config_roots r ON r.current_id = l.id
            WHERE r.id = ?
            "#,
        )
        .bind(root_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    pub async fn list_config_logs(&self, root_id: i64) -> Result<Vec<ConfigLogRecord>> {
        let rows = sqlx::query("SELECT * FROM config_logs WHERE root_id = ? ORDER BY id DESC")
            .bind(root_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    /// Delete log rows older than `cutoff` beyond the newest `keep` per root.
    /// `current` and `previous` rows are never deleted.
    pub async fn rotate_config_logs(&self, cutoff: DateTime<Utc>, keep: i64) -> Result<u64> {
        let roots = sqlx::query("SELECT current_id, previous_id FROM config_roots")
            .fetch_all(&self.pool)
            .await?;
        let mut protected = HashSet::new();
        for row in &roots {
            if let Some(id) = row.try_get::<Option<i64>, _>("current_id")? {
                protected.insert(id);
            }
            if let Some(id) = row.try_get::<Option<i64>, _>("previous_id")? {
                protected.insert(id);
            }
        }

        let rows = sqlx::query("SELECT id, root_id, created_at FROM config_logs ORDER BY root_id, id DESC")
            .fetch_all(&self.pool)
            .await?;

        let mut seen_per_root: HashMap<i64, i64> = HashMap::new();
        let mut doomed = Vec::new();
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let root_id: i64 = row.try_get("root_id")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;

            let rank = seen_per_root.entry(root_id).or_insert(0);
            *rank += 1;
            if *rank <= keep || protected.contains(&id) || created_at >= cutoff {
                continue;
            }
            doomed.push(id);
        }

        if doomed.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &doomed {
            sqlx::query("DELETE FROM config_logs WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!("Rotated {} config log rows", doomed.len());
        Ok(doomed.len() as u64)
    }
}
