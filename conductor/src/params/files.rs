//! Scratch area for file-typed config leaves.
//!
//! Each leaf lives at `<dir>/<owner_type>.<owner_id>[.group.<id>].<leaf path>`.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::schema::ConfigDefinition;
use crate::database::ObjectRef;

/// Prefix identifying whose config a file belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileScope(String);

impl FileScope {
    pub fn object(owner: ObjectRef) -> Self {
        Self(format!("{}.{}", owner.object_type, owner.id))
    }

    pub fn host_group(owner: ObjectRef, group_id: i64) -> Self {
        Self(format!("{}.{}.group.{}", owner.object_type, owner.id, group_id))
    }

    pub fn file_name(&self, leaf_path: &str) -> String {
        format!("{}.{}", self.0, leaf_path)
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, scope: &FileScope, leaf_path: &str) -> PathBuf {
        self.dir.join(scope.file_name(leaf_path))
    }

    /// Write every file-typed leaf of `config`; unchanged files are left alone
    pub async fn write_leaves(
        &self,
        scope: &FileScope,
        schema: &ConfigDefinition,
        config: &Value,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for leaf in schema.leaves() {
            if !leaf.field.field_type.is_file() {
                continue;
            }
            let path = self.path(scope, &leaf.path());
            match leaf.get(config).and_then(Value::as_str) {
                Some(content) => {
                    if write_if_changed(&path, content).await? {
                        written.push(path);
                    }
                }
                None => {
                    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                        tokio::fs::remove_file(&path).await?;
                    }
                }
            }
        }
        Ok(written)
    }
}

fn digest(content: &[u8]) -> Vec<u8> {
    Sha256::digest(content).to_vec()
}

/// Returns true when the file was (re)written
pub async fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if let Ok(existing) = tokio::fs::read(path).await {
        if digest(&existing) == digest(content.as_bytes()) {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Wrote config file {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_leaves_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let schema: ConfigDefinition = serde_json::from_value(json!([
            {"name": "plain", "type": "string"},
            {"name": "tls", "type": "group", "subs": [{"name": "cert", "type": "file"}]}
        ]))
        .unwrap();
        let scope = FileScope::object(ObjectRef::cluster(7));
        let config = json!({"plain": "x", "tls": {"cert": "PEM"}});

        let written = store.write_leaves(&scope, &schema, &config).await.unwrap();
        assert_eq!(written, vec![dir.path().join("cluster.7.tls.cert")]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cluster.7.tls.cert")).unwrap(),
            "PEM"
        );

        let again = store.write_leaves(&scope, &schema, &config).await.unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_group_scope_name() {
        let scope = FileScope::host_group(ObjectRef::service(3), 9);
        assert_eq!(scope.file_name("tls.cert"), "service.3.group.9.tls.cert");
    }
}
