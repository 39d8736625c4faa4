//! Keyed in-process advisory locks
//!
//! Concern propagation walks the topology of a cluster and then writes
//! concern rows; two such walks on the same cluster must not interleave.
//! Bundle loading is serialized per content hash the same way.
//!
//! # Usage
//!
//! ```ignore
//! let _guard = locks.lock(cluster_id).await;
//! // walk topology, write concerns...
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

pub struct KeyedLocks<K> {
    locks: Arc<RwLock<HashMap<K, Arc<Mutex<()>>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`; released when the guard drops
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let existing = self.locks.read().await.get(&key).cloned();
        let mutex = match existing {
            Some(mutex) => mutex,
            None => {
                let mut locks = self.locks.write().await;
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            }
        };
        debug!("Acquiring advisory lock {:?}", key);
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        // Guards and waiters hold their own clone of the Arc
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - locks.len()
    }
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Advisory lock keyed by cluster id
pub type ClusterLocks = KeyedLocks<i64>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks: ClusterLocks = KeyedLocks::new();
        let guard = locks.lock(1).await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.lock(1).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks: ClusterLocks = KeyedLocks::new();
        let _a = locks.lock(1).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks: KeyedLocks<String> = KeyedLocks::new();
        let held = locks.lock("held".to_string()).await;
        drop(locks.lock("free".to_string()).await);

        assert_eq!(locks.prune().await, 1);
        drop(held);
        assert_eq!(locks.prune().await, 1);
    }
}
