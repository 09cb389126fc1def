//! Shared counter store and block list.
//!
//! Counters must be atomic across every process sharing the store, so each
//! operation is a single round trip: no read-then-write sequences. Two
//! adapters are provided: [`MemoryStore`] for a single process and, with the
//! `redis-store` feature, [`RedisStore`] for a fleet.

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caller::CallerId;
use crate::ratelimit::WindowKey;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Errors raised by store adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store rejected or dropped the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The operation did not complete within its deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// A stored value could not be decoded.
    #[error("corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Atomically incrementable counters with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` by one and return the new value.
    ///
    /// The counter is created on first increment and expires `ttl` after
    /// creation. Increment and expiry happen in one atomic step.
    async fn increment(&self, key: &WindowKey, ttl: Duration) -> Result<u64, StoreError>;

    /// Read the counter for `key` without modifying it. Missing is zero.
    async fn peek(&self, key: &WindowKey) -> Result<u64, StoreError>;
}

/// Kind of restriction placed on a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// Every request is refused until expiry.
    Block,
    /// Requests count against reduced limits until expiry.
    Throttle,
}

/// A temporary restriction on a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub kind: BlockKind,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

impl BlockEntry {
    /// Create a full block.
    pub fn block(expires_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Block,
            expires_at,
            reason: reason.into(),
        }
    }

    /// Create a throttle.
    pub fn throttle(expires_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Throttle,
            expires_at,
            reason: reason.into(),
        }
    }

    /// Whether the entry still applies at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Time left before the entry lapses, zero when already expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Temporary per-caller restrictions with lazy expiry.
#[async_trait]
pub trait BlockList: Send + Sync {
    /// Place or replace the restriction for a caller.
    async fn restrict(&self, caller: &CallerId, entry: BlockEntry) -> Result<(), StoreError>;

    /// Current restriction, if any. Entries expired at `now` are absent.
    async fn lookup(
        &self,
        caller: &CallerId,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockEntry>, StoreError>;

    /// Remove any restriction for a caller.
    async fn lift(&self, caller: &CallerId) -> Result<(), StoreError>;
}

/// A store that holds both counters and the block list.
pub trait SharedStore: CounterStore + BlockList {}

impl<T: CounterStore + BlockList> SharedStore for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_entry_expiry() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let entry = BlockEntry::block(now + chrono::Duration::seconds(30), "fraud");

        assert!(entry.is_active(now));
        assert_eq!(entry.remaining(now), Duration::from_secs(30));

        let later = now + chrono::Duration::seconds(30);
        assert!(!entry.is_active(later));
        assert_eq!(entry.remaining(later), Duration::ZERO);
    }

    #[test]
    fn test_block_entry_json() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let json = serde_json::to_string(&BlockEntry::throttle(now, "velocity")).unwrap();
        assert!(json.contains("\"kind\":\"throttle\""));
    }
}
