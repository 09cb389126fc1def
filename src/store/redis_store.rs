//! Redis-backed store shared by every instance of the service.
//!
//! ## Key layout
//!
//! - Counters: `{prefix}counter|{window key}` holding an integer, with a
//!   millisecond TTL set by the same script that increments it.
//! - Block list: `{prefix}block|{caller}` holding a JSON [`BlockEntry`] with
//!   a `PX` TTL matching the entry's expiry.
//!
//! The increment runs as a Lua script so `INCR` and `PEXPIRE` are applied in
//! one round trip and cannot interleave with another instance's increment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, warn};

use super::{BlockEntry, BlockList, CounterStore, StoreError};
use crate::caller::CallerId;
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::WindowKey;

/// INCR the counter, and give it a TTL when it has none (first increment,
/// or a previous expiry that was lost).
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key this store writes (default: "tollgate:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tollgate:".to_string(),
        }
    }
}

/// Counter store and block list backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    increment: Script,
    config: RedisStoreConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect and verify the server answers `PING`.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let mut connection = ConnectionManager::new(client).await.map_err(unavailable)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;

        debug!(prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
            config,
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// Measure block entry lifetimes against `clock` instead of the system
    /// clock. Needed when entries carry expiries from a replayed timeline.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn counter_key(&self, key: &WindowKey) -> String {
        format!("{}counter|{}", self.config.key_prefix, key.to_store_key())
    }

    fn block_key(&self, caller: &CallerId) -> String {
        format!("{}block|{}", self.config.key_prefix, caller)
    }
}

/// Milliseconds until `entry` lapses as of `now`, at least one so `PX`
/// accepts it.
fn block_ttl_ms(entry: &BlockEntry, now: DateTime<Utc>) -> u64 {
    entry.remaining(now).as_millis().max(1) as u64
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &WindowKey, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let count: u64 = self
            .increment
            .key(self.counter_key(key))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(count)
    }

    async fn peek(&self, key: &WindowKey) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: Option<u64> = redis::cmd("GET")
            .arg(self.counter_key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(count.unwrap_or(0))
    }
}

#[async_trait]
impl BlockList for RedisStore {
    async fn restrict(&self, caller: &CallerId, entry: BlockEntry) -> Result<(), StoreError> {
        let key = self.block_key(caller);
        let ttl_ms = block_ttl_ms(&entry, self.clock.now());
        let json = serde_json::to_string(&entry).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn lookup(
        &self,
        caller: &CallerId,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockEntry>, StoreError> {
        let key = self.block_key(caller);
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<BlockEntry>(&raw) {
            Ok(entry) if entry.is_active(now) => Ok(Some(entry)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring undecodable block list entry");
                Ok(None)
            }
        }
    }

    async fn lift(&self, caller: &CallerId) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.block_key(caller))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
