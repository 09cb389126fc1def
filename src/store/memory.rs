//! In-process store for single-instance deployments and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{BlockEntry, BlockList, CounterStore, StoreError};
use crate::caller::CallerId;
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::WindowKey;

#[derive(Debug, Clone, Copy)]
struct Cell {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Counter store and block list held in sharded concurrent maps.
///
/// Each key is updated under its shard's entry lock, which gives the same
/// per-key atomicity a Redis `INCR` does. Expired counters are reclaimed
/// lazily on access and in bulk by [`MemoryStore::purge_expired`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    counters: Arc<DashMap<String, Cell>>,
    blocks: Arc<DashMap<CallerId, BlockEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store that reads the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store with an explicit clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            blocks: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of live counters, including ones not yet reclaimed.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop every expired counter and block entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len() + self.blocks.len();
        self.counters.retain(|_, cell| cell.expires_at > now);
        self.blocks.retain(|_, entry| entry.is_active(now));
        let removed = before.saturating_sub(self.counters.len() + self.blocks.len());
        if removed > 0 {
            debug!(removed, "Purged expired entries from memory store");
        }
        removed
    }

    /// Clear all counters and block entries.
    pub fn clear(&self) {
        self.counters.clear();
        self.blocks.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &WindowKey, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Unavailable(format!("invalid ttl: {}", e)))?;

        let mut cell = self.counters.entry(key.to_store_key()).or_insert(Cell {
            count: 0,
            expires_at: now + ttl,
        });
        if cell.expires_at <= now {
            *cell = Cell {
                count: 0,
                expires_at: now + ttl,
            };
        }
        cell.count += 1;
        Ok(cell.count)
    }

    async fn peek(&self, key: &WindowKey) -> Result<u64, StoreError> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(&key.to_store_key())
            .filter(|cell| cell.expires_at > now)
            .map(|cell| cell.count)
            .unwrap_or(0))
    }
}

#[async_trait]
impl BlockList for MemoryStore {
    async fn restrict(&self, caller: &CallerId, entry: BlockEntry) -> Result<(), StoreError> {
        self.blocks.insert(caller.clone(), entry);
        Ok(())
    }

    async fn lookup(
        &self,
        caller: &CallerId,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockEntry>, StoreError> {
        Ok(self
            .blocks
            .get(caller)
            .filter(|entry| entry.is_active(now))
            .map(|entry| entry.value().clone()))
    }

    async fn lift(&self, caller: &CallerId) -> Result<(), StoreError> {
        self.blocks.remove(caller);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::Tier;

    fn setup() -> (MemoryStore, MockClock) {
        let clock = MockClock::at_unix(1_704_067_200);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    fn key(clock: &MockClock) -> WindowKey {
        let caller = CallerId::new("caller-a").unwrap();
        WindowKey::at(&caller, "default", Tier::Minute, clock.now())
    }

    #[tokio::test]
    async fn test_increment_returns_running_count() {
        let (store, clock) = setup();
        let key = key(&clock);
        let ttl = Duration::from_secs(65);

        assert_eq!(store.increment(&key, ttl).await.unwrap(), 1);
        assert_eq!(store.increment(&key, ttl).await.unwrap(), 2);
        assert_eq!(store.peek(&key).await.unwrap(), 2);
    }

    #[test]
    fn test_peek_missing_is_zero() {
        let (store, clock) = setup();
        let count = tokio_test::assert_ok!(tokio_test::block_on(store.peek(&key(&clock))));
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_counter_expires_after_ttl() {
        let (store, clock) = setup();
        let key = key(&clock);
        store.increment(&key, Duration::from_secs(65)).await.unwrap();

        clock.advance_secs(65);
        assert_eq!(store.peek(&key).await.unwrap(), 0);
        assert_eq!(store.increment(&key, Duration::from_secs(65)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (store, clock) = setup();
        let key = key(&clock);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.increment(&key, Duration::from_secs(65)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.peek(&key).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_block_list_lazy_expiry() {
        let (store, clock) = setup();
        let caller = CallerId::new("caller-a").unwrap();
        let until = clock.now() + chrono::Duration::seconds(30);

        store
            .restrict(&caller, BlockEntry::block(until, "test"))
            .await
            .unwrap();
        assert!(store.lookup(&caller, clock.now()).await.unwrap().is_some());

        clock.advance_secs(30);
        assert!(store.lookup(&caller, clock.now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = setup();
        let key = key(&clock);
        store.increment(&key, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.counter_count(), 1);

        clock.advance_secs(11);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.counter_count(), 0);
    }
}
