//! Sharded per-key lock table.
//!
//! Each row lives behind its own `tokio::sync::Mutex`; holding the guard *is*
//! holding the row's exclusive lock. Shards only protect the key -> row map
//! and are held for a lookup or insert, never across an `.await`.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

/// Exclusive guard over one row.
pub type RowGuard<V> = OwnedMutexGuard<V>;

/// Map of rows, each individually lockable.
///
/// Rows are never removed, so a row handle obtained from the map stays the
/// authoritative copy for as long as anyone holds it.
#[derive(Debug)]
pub struct LockTable<K, V> {
    shards: Vec<Mutex<HashMap<K, Arc<RowMutex<V>>>>>,
}

impl<K, V> LockTable<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a table with `shards` shards (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, Arc<RowMutex<V>>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn row(&self, key: &K) -> Option<Arc<RowMutex<V>>> {
        let shard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
        shard.get(key).cloned()
    }

    /// Lock an existing row, waiting for any current holder.
    pub async fn lock(&self, key: &K) -> Option<RowGuard<V>> {
        let row = self.row(key)?;
        Some(row.lock_owned().await)
    }

    /// Lock a row, creating it with `init` if absent. Returns whether the row
    /// was created by this call.
    pub async fn lock_or_insert_with<F>(&self, key: &K, init: F) -> (RowGuard<V>, bool)
    where
        F: FnOnce() -> V,
    {
        let (row, created) = {
            let mut shard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
            match shard.entry(key.clone()) {
                Entry::Occupied(e) => (e.get().clone(), false),
                Entry::Vacant(e) => (e.insert(Arc::new(RowMutex::new(init()))).clone(), true),
            }
        };
        (row.lock_owned().await, created)
    }

    /// Insert a row if the key is free. Returns `false` if it already existed.
    pub fn insert_new(&self, key: K, value: V) -> bool {
        let mut shard = self.shard(&key).lock().unwrap_or_else(PoisonError::into_inner);
        match shard.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(Arc::new(RowMutex::new(value)));
                true
            }
        }
    }

    /// Snapshot of keys matching `filter`. Rows created afterwards are not
    /// included.
    pub fn keys_where<F>(&self, mut filter: F) -> Vec<K>
    where
        F: FnMut(&K) -> bool,
    {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            out.extend(shard.keys().filter(|k| filter(k)).cloned());
        }
        out
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
