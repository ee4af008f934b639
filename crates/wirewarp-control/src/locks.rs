//! Per-key serialization
//!
//! Mutations are serialized per affected key (token, agent, tunnel server)
//! instead of behind one global lock. Lock order is agent before server, and
//! servers in ascending ID order. No lock is ever awaited while a database
//! transaction is open.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// A table of async mutexes created on demand, one per key
pub struct KeyedLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// All lock partitions used by the control plane
#[derive(Default)]
pub struct LockTable {
    /// Keyed by token hash
    pub tokens: KeyedLocks<String>,
    pub agents: KeyedLocks<Uuid>,
    pub servers: KeyedLocks<Uuid>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock several tunnel servers in a deadlock-free order
    pub async fn lock_servers(&self, ids: &[Uuid]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.servers.lock(id).await);
        }
        guards
    }

    pub fn prune(&self) {
        self.tokens.prune();
        self.agents.prune();
        self.servers.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let guard = locks.lock(1).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(1).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(1).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2))
            .await
            .expect("independent key should not block");
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = KeyedLocks::<u32>::new();
        let held = locks.lock(1).await;
        drop(locks.lock(2).await);

        locks.prune();
        assert_eq!(locks.len(), 1);

        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_lock_servers_dedups() {
        let table = LockTable::new();
        let id = Uuid::new_v4();
        let guards = table.lock_servers(&[id, id]).await;
        assert_eq!(guards.len(), 1);
    }
}
