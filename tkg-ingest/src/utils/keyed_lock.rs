//! Per-key async locks.
//!
//! Writers to the same key are serialized; different keys never contend.
//! Lock cells are created on demand in a sharded map and removed once the
//! last holder or waiter lets go, so the map only holds keys in use.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyedLocks<K: Eq + Hash> {
    cells: DashMap<K, Arc<Mutex<()>>>,
}

/// Exclusive access to one key. The cell is pruned on drop when idle.
pub struct KeyGuard<'a, K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    cells: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        // Release first so the map holds the only remaining handle.
        self.guard.take();
        self.cells
            .remove_if(&self.key, |_, cell| Arc::strong_count(cell) == 1);
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    fn cell(&self, key: &K) -> Arc<Mutex<()>> {
        self.cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: &K, guard: OwnedMutexGuard<()>) -> KeyGuard<'_, K> {
        KeyGuard {
            guard: Some(guard),
            cells: &self.cells,
            key: key.clone(),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let held = self.cell(key).lock_owned().await;
        self.guard(key, held)
    }

    /// Take exclusive access to `key` only if nobody holds it.
    pub fn try_lock(&self, key: &K) -> Option<KeyGuard<'_, K>> {
        let cell = self.cell(key);
        let held = cell.try_lock_owned().ok()?;
        Some(self.guard(key, held))
    }

    /// Number of keys currently held or awaited.
    pub fn live_keys(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.try_lock(&"cluster-a").expect("first lock");
        assert!(locks.try_lock(&"cluster-a").is_none());
        drop(guard);
        assert!(locks.try_lock(&"cluster-a").is_some());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&1u32).await;
        assert!(locks.try_lock(&2u32).is_some());
    }

    #[tokio::test]
    async fn waiting_lock_acquires_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(&"k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&"k").await;
                true
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn released_keys_are_pruned() {
        let locks = Arc::new(KeyedLocks::new());
        let a = locks.lock(&"a").await;
        let b = locks.try_lock(&"b").expect("free key");
        assert_eq!(locks.live_keys(), 2);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&"a").await;
            })
        };
        tokio::task::yield_now().await;

        drop(b);
        assert_eq!(locks.live_keys(), 1);
        drop(a);
        assert_eq!(locks.live_keys(), 1, "waiter still needs the cell");

        waiter.await.unwrap();
        assert_eq!(locks.live_keys(), 0);
    }

    #[tokio::test]
    async fn failed_try_lock_leaves_no_cell_behind() {
        let locks = KeyedLocks::new();
        let held = locks.lock(&7u32).await;
        assert!(locks.try_lock(&7u32).is_none());
        drop(held);
        assert_eq!(locks.live_keys(), 0);
    }
}
