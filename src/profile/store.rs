use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BehaviorProfile, ProfileParams};
use crate::caller::{CallerId, RequestEvent};
use crate::clock::Clock;
use crate::error::{Result, TollgateError};
use crate::sink::{Diagnostic, DiagnosticKind, EventSink, SecurityRecord, TracingSink};

/// Concurrent map of caller profiles.
///
/// Readers get an `Arc` snapshot and never block writers for longer than one
/// in-memory update. Profiles are only removed by [`ProfileStore::evict_idle`].
pub struct ProfileStore {
    profiles: DashMap<CallerId, Arc<BehaviorProfile>>,
    params: ProfileParams,
    sink: Arc<dyn EventSink>,
}

impl ProfileStore {
    pub fn new(params: ProfileParams) -> Self {
        Self {
            profiles: DashMap::new(),
            params,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn params(&self) -> &ProfileParams {
        &self.params
    }

    /// Fold `event` into its caller's profile and return the new snapshot.
    ///
    /// The first event for a caller creates its profile.
    pub fn update(&self, event: &RequestEvent) -> Arc<BehaviorProfile> {
        let mut entry = self
            .profiles
            .entry(event.caller_id.clone())
            .or_insert_with(|| {
                debug!(caller = %event.caller_id, "Creating behavior profile");
                Arc::new(BehaviorProfile::cold(event.caller_id.clone(), event.timestamp))
            });

        let next = Arc::new(entry.observe(event, &self.params));
        *entry = Arc::clone(&next);
        next
    }

    /// Current profile for `caller`, if one exists.
    pub fn get(&self, caller: &CallerId) -> Option<Arc<BehaviorProfile>> {
        self.profiles.get(caller).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Serialize a caller's profile as JSON.
    pub fn export(&self, caller: &CallerId) -> Option<String> {
        let profile = self.get(caller)?;
        match serde_json::to_string(profile.as_ref()) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(caller = %caller, error = %e, "Failed to serialize profile");
                None
            }
        }
    }

    /// Decode a serialized profile, checking it belongs to `caller` and holds
    /// usable statistics.
    pub fn decode(caller: &CallerId, raw: &str) -> Result<BehaviorProfile> {
        let corrupt = |reason: String| TollgateError::ProfileCorrupt {
            caller: caller.to_string(),
            reason,
        };

        let profile: BehaviorProfile =
            serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;

        if &profile.caller_id != caller {
            return Err(corrupt(format!("profile belongs to {}", profile.caller_id)));
        }
        if !profile.is_consistent() {
            return Err(corrupt("non-finite or negative statistics".to_string()));
        }

        Ok(profile)
    }

    /// Install a serialized profile for `caller`.
    ///
    /// A profile that fails to decode is treated as absent: the caller gets a
    /// cold profile and a diagnostic is published.
    pub fn import(&self, caller: &CallerId, raw: &str, now: DateTime<Utc>) -> Arc<BehaviorProfile> {
        let profile = match Self::decode(caller, raw) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(caller = %caller, error = %e, "Discarding corrupt profile");
                self.sink.publish(SecurityRecord::Diagnostic(Diagnostic::new(
                    DiagnosticKind::ProfileCorrupt,
                    Some(caller),
                    e.to_string(),
                    now,
                )));
                BehaviorProfile::cold(caller.clone(), now)
            }
        };

        let profile = Arc::new(profile);
        self.profiles.insert(caller.clone(), Arc::clone(&profile));
        profile
    }

    /// Remove profiles not updated within `max_idle` of `now`. Returns how
    /// many were removed.
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|max_idle| now.checked_sub_signed(max_idle))
        else {
            return 0;
        };

        let before = self.profiles.len();
        self.profiles.retain(|_, profile| profile.last_updated >= cutoff);
        let removed = before.saturating_sub(self.profiles.len());
        if removed > 0 {
            debug!(removed, "Evicted idle behavior profiles");
        }
        removed
    }

    /// Run [`ProfileStore::evict_idle`] every `interval` until the task is aborted.
    pub fn spawn_reaper(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                max_idle_secs = max_idle.as_secs(),
                "Profile reaper started"
            );

            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately.
            timer.tick().await;

            loop {
                timer.tick().await;
                self.evict_idle(clock.now(), max_idle);
            }
        })
    }
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore")
            .field("profiles", &self.profiles.len())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::sink::CollectingSink;

    fn caller(id: &str) -> CallerId {
        CallerId::new(id).unwrap()
    }

    fn event(id: &str, secs: i64) -> RequestEvent {
        RequestEvent {
            caller_id: caller(id),
            endpoint: "/search".to_string(),
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
            response_time_ms: 120,
            status_code: 200,
            payload_size: 2_048,
        }
    }

    #[test]
    fn test_update_creates_and_replaces_snapshot() {
        let store = ProfileStore::new(ProfileParams::default());
        let first = store.update(&event("a", 10));
        let second = store.update(&event("a", 11));

        assert_eq!(first.sample_count, 1);
        assert_eq!(second.sample_count, 2);
        // Earlier snapshots are not mutated.
        assert_eq!(first.sample_count, 1);
        assert_eq!(store.get(&caller("a")).unwrap().sample_count, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_export_import_preserves_statistics() {
        let store = ProfileStore::new(ProfileParams::default());
        for t in 0..10 {
            store.update(&event("a", t));
        }
        let json = store.export(&caller("a")).unwrap();

        let restored = ProfileStore::new(ProfileParams::default());
        let profile = restored.import(&caller("a"), &json, Utc::now());
        let original = store.get(&caller("a")).unwrap();
        assert_eq!(profile.sample_count, original.sample_count);
        assert_eq!(profile.last_updated, original.last_updated);
        assert!((profile.request_rate.mean - original.request_rate.mean).abs() < 1e-9);
        assert!((profile.payload_size.mean - original.payload_size.mean).abs() < 1e-9);
    }

    #[test]
    fn test_corrupt_profile_becomes_cold() {
        let sink = Arc::new(CollectingSink::new());
        let store = ProfileStore::new(ProfileParams::default()).with_sink(sink.clone());

        let profile = store.import(&caller("a"), "{not json", Utc::now());
        assert_eq!(profile.sample_count, 0);
        assert_eq!(store.get(&caller("a")).unwrap().sample_count, 0);

        let diagnostics = sink.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::ProfileCorrupt);
    }

    #[test]
    fn test_decode_rejects_foreign_profile() {
        let store = ProfileStore::new(ProfileParams::default());
        store.update(&event("a", 0));
        let json = store.export(&caller("a")).unwrap();

        assert!(matches!(
            ProfileStore::decode(&caller("b"), &json),
            Err(TollgateError::ProfileCorrupt { .. })
        ));
    }

    #[test]
    fn test_evict_idle() {
        let store = ProfileStore::new(ProfileParams::default());
        store.update(&event("old", 0));
        store.update(&event("new", 1_000));

        let now = DateTime::from_timestamp(1_100, 0).unwrap();
        let removed = store.evict_idle(now, Duration::from_secs(500));

        assert_eq!(removed, 1);
        assert!(store.get(&caller("old")).is_none());
        assert!(store.get(&caller("new")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_on_interval() {
        let clock = MockClock::at_unix(10_000);
        let store = Arc::new(ProfileStore::new(ProfileParams::default()));
        store.update(&event("old", 0));

        let handle = Arc::clone(&store).spawn_reaper(
            Arc::new(clock.clone()),
            Duration::from_secs(60),
            Duration::from_secs(3_600),
        );
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        handle.abort();
    }
}
