use crate::identity::{ActorId, Endpoint, TenantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

/// Key of one window counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    /// Tenant whose budget is being counted.
    pub tenant: TenantId,
    /// Counted actor.
    pub actor: ActorId,
    /// Budgeted endpoint.
    pub endpoint: Endpoint,
    /// Window start, ms since epoch, truncated to the window size.
    pub window_start_millis: u64,
}

/// Abstract storage interface for window counters.
///
/// This trait is designed to support both in-memory and external backends
/// (a SQL upsert, a Redis `INCR`). The one hard requirement is that
/// [`increment`](WindowStore::increment) is a single atomic
/// upsert-and-read-back: a read followed by a separate write lets concurrent
/// callers both observe a count under the limit.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert the counter at 1 or add 1 to it, returning the new count.
    ///
    /// `window_end_millis` is recorded with a new counter so that cleanup can
    /// tell whether the window is still current.
    async fn increment(&self, key: &WindowKey, window_end_millis: u64) -> Result<u64, Self::Error>;

    /// Current count, if the counter exists.
    async fn count(&self, key: &WindowKey) -> Result<Option<u64>, Self::Error>;

    /// Delete counters whose window started before `cutoff_millis` and
    /// ended at or before `now_millis`. Returns the number removed.
    async fn purge(&self, cutoff_millis: u64, now_millis: u64) -> Result<usize, Self::Error>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    window_end_millis: u64,
}

type Shard = Mutex<HashMap<WindowKey, Counter>>;

/// Sharded in-memory window store.
#[derive(Clone, Debug)]
pub struct InMemoryWindowStore {
    shards: Arc<Vec<Shard>>,
}

impl InMemoryWindowStore {
    /// Store with 16 shards.
    pub fn new() -> Self {
        Self::with_shards(16)
    }

    /// Store with `shards` shards (at least one).
    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards: Arc::new(shards) }
    }

    fn shard(&self, key: &WindowKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Whether no counters are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    type Error = std::convert::Infallible;

    async fn increment(&self, key: &WindowKey, window_end_millis: u64) -> Result<u64, Self::Error> {
        let mut guard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
        let counter = guard
            .entry(key.clone())
            .or_insert(Counter { count: 0, window_end_millis });
        counter.count = counter.count.saturating_add(1);
        Ok(counter.count)
    }

    async fn count(&self, key: &WindowKey) -> Result<Option<u64>, Self::Error> {
        let guard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).map(|c| c.count))
    }

    async fn purge(&self, cutoff_millis: u64, now_millis: u64) -> Result<usize, Self::Error> {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = guard.len();
            guard.retain(|key, counter| {
                key.window_start_millis >= cutoff_millis || counter.window_end_millis > now_millis
            });
            removed += before - guard.len();
        }
        Ok(removed)
    }
}
