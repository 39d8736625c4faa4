//! Prototype catalog: read model over accepted bundles.
//!
//! Prototypes and actions are immutable once a bundle is stored, so they are
//! cached by id after the first read.

pub mod definition;
pub mod version;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::advisory::KeyedLocks;
use crate::config::DirsConfig;
use crate::constants::bundles::BUNDLE_CONFIG_FILE;
use crate::database::{ActionRecord, BundleRecord, Database, PrototypeRecord, UpgradeRecord};
use crate::errors::ConductorError;
use crate::params::schema::ConfigDefinition;
use definition::{BundleDefinition, PrototypeType, Requirement};

/// Where a config schema comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSource {
    Prototype(i64),
    Action(i64),
}

pub struct Catalog {
    db: Arc<Database>,
    prototypes: Arc<RwLock<HashMap<i64, Arc<PrototypeRecord>>>>,
    actions: Arc<RwLock<HashMap<i64, Arc<ActionRecord>>>>,
    load_locks: KeyedLocks<String>,
}

impl Catalog {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            prototypes: Arc::new(RwLock::new(HashMap::new())),
            actions: Arc::new(RwLock::new(HashMap::new())),
            load_locks: KeyedLocks::new(),
        }
    }

    /// Accept a parsed bundle. Loading the same content twice returns the
    /// existing bundle id.
    #[instrument(skip(self, bundle), fields(bundle = %bundle.name(), hash = %bundle.hash))]
    pub async fn load_bundle(&self, bundle: &BundleDefinition) -> Result<i64> {
        let _guard = self.load_locks.lock(bundle.hash.clone()).await;

        if let Some(existing) = self.db.find_bundle_by_hash(&bundle.hash).await? {
            info!("Bundle already loaded as #{}", existing.id);
            return Ok(existing.id);
        }

        bundle.validate()?;
        self.db.store_bundle(bundle).await
    }

    /// Accept an unpacked bundle directory: its files are copied below the
    /// stack dir under the bundle hash, then the definition is loaded
    #[instrument(skip(self, dirs))]
    pub async fn install_dir(&self, source: &Path, dirs: &DirsConfig) -> Result<i64> {
        let config_path = source.join(BUNDLE_CONFIG_FILE);
        let text = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| anyhow!("Failed to read {}: {}", config_path.display(), e))?;
        let bundle = BundleDefinition::from_yaml(&text)?;
        bundle.validate()?;

        let target = dirs.bundle_dir(&bundle.hash);
        if !tokio::fs::try_exists(&target).await? {
            copy_tree(source, &target).await?;
            debug!("Bundle files copied to {}", target.display());
        }
        self.load_bundle(&bundle).await
    }

    pub async fn get_bundle(&self, bundle_id: i64) -> Result<BundleRecord> {
        self.db.get_bundle(bundle_id).await?.ok_or_else(|| {
            ConductorError::ObjectNotFound {
                object: format!("bundle #{}", bundle_id),
            }
            .into()
        })
    }

    pub async fn prototype(&self, prototype_id: i64) -> Result<Arc<PrototypeRecord>> {
        if let Some(cached) = self.prototypes.read().await.get(&prototype_id) {
            return Ok(cached.clone());
        }

        let record = self.db.get_prototype(prototype_id).await?.ok_or_else(|| {
            ConductorError::PrototypeNotFound {
                name: format!("#{}", prototype_id),
            }
        })?;
        let record = Arc::new(record);
        self.prototypes
            .write()
            .await
            .insert(prototype_id, record.clone());
        Ok(record)
    }

    /// Look a prototype up by name; components need their service's name
    pub async fn get_prototype(
        &self,
        bundle_id: i64,
        prototype_type: PrototypeType,
        name: &str,
        parent_name: Option<&str>,
    ) -> Result<Option<Arc<PrototypeRecord>>> {
        let parent_id = match parent_name {
            Some(parent) => {
                let parent_type = match prototype_type {
                    PrototypeType::Component => PrototypeType::Service,
                    PrototypeType::Host => PrototypeType::Provider,
                    other => other,
                };
                match self
                    .db
                    .find_prototype(bundle_id, parent_type, parent, None)
                    .await?
                {
                    Some(parent) => Some(parent.id),
                    None => return Ok(None),
                }
            }
            None => None,
        };

        let found = self
            .db
            .find_prototype(bundle_id, prototype_type, name, parent_id)
            .await?;
        match found {
            Some(record) => Ok(Some(self.prototype(record.id).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_prototypes(&self, bundle_id: i64) -> Result<Vec<PrototypeRecord>> {
        self.db.list_prototypes(bundle_id).await
    }

    /// Component prototypes of a service prototype
    pub async fn list_components(&self, service_prototype_id: i64) -> Result<Vec<PrototypeRecord>> {
        self.db.list_child_prototypes(service_prototype_id).await
    }

    pub async fn list_actions(&self, prototype_id: i64) -> Result<Vec<ActionRecord>> {
        self.db.list_actions(prototype_id).await
    }

    pub async fn action(&self, action_id: i64) -> Result<Arc<ActionRecord>> {
        if let Some(cached) = self.actions.read().await.get(&action_id) {
            return Ok(cached.clone());
        }

        let record = self.db.get_action(action_id).await?.ok_or_else(|| {
            ConductorError::PrototypeNotFound {
                name: format!("action #{}", action_id),
            }
        })?;
        let record = Arc::new(record);
        self.actions.write().await.insert(action_id, record.clone());
        Ok(record)
    }

    pub async fn find_action(&self, prototype_id: i64, name: &str) -> Result<Option<ActionRecord>> {
        Ok(self
            .list_actions(prototype_id)
            .await?
            .into_iter()
            .find(|a| a.name == name))
    }

    pub async fn list_requires(&self, prototype_id: i64) -> Result<Vec<Requirement>> {
        Ok(self.prototype(prototype_id).await?.spec.requires.clone())
    }

    /// Schema declared by a prototype or an action; empty when none
    pub async fn get_config_schema(&self, source: SchemaSource) -> Result<ConfigDefinition> {
        let schema = match source {
            SchemaSource::Prototype(id) => self.prototype(id).await?.spec.config.clone(),
            SchemaSource::Action(id) => self.action(id).await?.spec.config.clone(),
        };
        Ok(schema.unwrap_or_default())
    }

    /// Upgrades declared by a bundle, ordered by their lower version bound
    pub async fn list_upgrades(&self, bundle_id: i64) -> Result<Vec<UpgradeRecord>> {
        let mut upgrades = self.db.list_upgrades(bundle_id).await?;
        upgrades.sort_by(|a, b| {
            let left = a.spec.versions.min.as_deref().or(a.spec.versions.min_strict.as_deref());
            let right = b.spec.versions.min.as_deref().or(b.spec.versions.min_strict.as_deref());
            version::compare(left.unwrap_or("0"), right.unwrap_or("0"))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(upgrades)
    }

    pub async fn get_upgrade(&self, upgrade_id: i64) -> Result<UpgradeRecord> {
        self.db.get_upgrade(upgrade_id).await?.ok_or_else(|| {
            ConductorError::PrototypeNotFound {
                name: format!("upgrade #{}", upgrade_id),
            }
            .into()
        })
    }
}

/// Recursive directory copy
async fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let destination = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), destination));
            } else {
                tokio::fs::copy(entry.path(), destination).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copy_tree_keeps_layout() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        tokio::fs::create_dir_all(source.path().join("ansible/roles")).await.unwrap();
        tokio::fs::write(source.path().join("config.yaml"), "---").await.unwrap();
        tokio::fs::write(source.path().join("ansible/roles/main.yaml"), "- hosts: all").await.unwrap();

        let dest = target.path().join("bundle");
        copy_tree(source.path(), &dest).await.unwrap();

        assert!(dest.join("config.yaml").exists());
        let playbook = tokio::fs::read_to_string(dest.join("ansible/roles/main.yaml")).await.unwrap();
        assert_eq!(playbook, "- hosts: all");
    }
}
