//! Window codec: maps wall-clock time onto fixed-size tier buckets.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::caller::CallerId;

/// Quota tier, one fixed window length each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Per-minute quota
    Minute,
    /// Per-hour quota
    Hour,
    /// Per-day quota
    Day,
}

impl Tier {
    /// All tiers, shortest first.
    pub const ALL: [Tier; 3] = [Tier::Minute, Tier::Hour, Tier::Day];

    /// Get the duration of this tier's window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.window_secs() as u64)
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> i64 {
        match self {
            Tier::Minute => 60,
            Tier::Hour => 3_600,
            Tier::Day => 86_400,
        }
    }

    /// Name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Minute => "minute",
            Tier::Hour => "hour",
            Tier::Day => "day",
        }
    }

    /// Start of the bucket containing `at`, in epoch seconds.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.window_secs()) * self.window_secs()
    }

    /// Instant at which the bucket containing `at` rolls over.
    pub fn reset_at(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let end = self.bucket_start(at) + self.window_secs();
        DateTime::from_timestamp(end, 0).unwrap_or(at)
    }

    /// Counter TTL: the window length plus a grace period for boundary reads.
    pub fn ttl(&self, grace: Duration) -> Duration {
        self.duration() + grace
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one counter: a caller's usage of a tier in one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The caller being counted.
    pub caller: CallerId,
    /// Endpoint class the quota belongs to.
    pub scope: String,
    /// The tier.
    pub tier: Tier,
    /// Bucket start, epoch seconds floored to the tier boundary.
    pub bucket_start: i64,
}

impl WindowKey {
    /// Compute the key for the bucket containing `at`.
    pub fn at(caller: &CallerId, scope: &str, tier: Tier, at: DateTime<Utc>) -> Self {
        Self {
            caller: caller.clone(),
            scope: scope.to_string(),
            tier,
            bucket_start: tier.bucket_start(at),
        }
    }

    /// Render as a store key.
    ///
    /// Format: `"{scope}|{caller}|{tier}|{bucket_start}"`. The caller sits
    /// between two fields without `|`, so ids containing `|` still parse.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.scope, self.caller, self.tier, self.bucket_start
        )
    }

    /// Parse a store key produced by [`WindowKey::to_store_key`].
    pub fn from_store_key(key: &str) -> Option<Self> {
        let (scope, rest) = key.split_once('|')?;
        let (rest, bucket) = rest.rsplit_once('|')?;
        let (caller, tier) = rest.rsplit_once('|')?;

        let tier = match tier {
            "minute" => Tier::Minute,
            "hour" => Tier::Hour,
            "day" => Tier::Day,
            _ => return None,
        };

        Some(Self {
            caller: CallerId::new(caller)?,
            scope: scope.to_string(),
            tier,
            bucket_start: bucket.parse().ok()?,
        })
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}
