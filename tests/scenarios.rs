//! End-to-end behavior of the limiter and security pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;

use tollgate::caller::{CallerId, RequestEvent};
use tollgate::clock::MockClock;
use tollgate::config::TollgateConfig;
use tollgate::detect::{AnomalyKind, Severity};
use tollgate::fraud::{CallerState, FraudAction};
use tollgate::ratelimit::{ClassRules, LimiterSettings, RateLimiter, Tier, TierLimits, Verdict, WindowKey};
use tollgate::sink::{CollectingSink, DiagnosticKind};
use tollgate::store::{BlockEntry, BlockList, CounterStore, MemoryStore, StoreError};
use tollgate::SecurityPipeline;

const NOW: i64 = 1_000_000;

fn caller(id: &str) -> CallerId {
    CallerId::new(id).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn request(id: &str, secs: i64, status: u16, payload: u64) -> RequestEvent {
    RequestEvent {
        caller_id: caller(id),
        endpoint: "/v1/generate".to_string(),
        timestamp: at(secs),
        response_time_ms: 200,
        status_code: status,
        payload_size: payload,
    }
}

/// Fifty typical requests a minute apart ending just before `NOW`, one failing.
fn warm_up(id: &str) -> Vec<RequestEvent> {
    (0..50)
        .map(|i| {
            let status = if i == 25 { 500 } else { 200 };
            request(id, NOW - 60 * (50 - i), status, 1_024)
        })
        .collect()
}

fn ai_rules() -> ClassRules {
    ClassRules::default().with_class("ai_generation", TierLimits::new(Some(5), Some(100), None))
}

struct Harness {
    clock: MockClock,
    sink: Arc<CollectingSink>,
    limiter: Arc<RateLimiter>,
}

impl Harness {
    fn new() -> Self {
        let clock = MockClock::at_unix(NOW);
        let sink = Arc::new(CollectingSink::new());
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = Arc::new(
            RateLimiter::new(store, ai_rules())
                .with_clock(Arc::new(clock.clone()))
                .with_sink(sink.clone()),
        );
        Self {
            clock,
            sink,
            limiter,
        }
    }

    fn pipeline(&self) -> SecurityPipeline {
        SecurityPipeline::start(
            &TollgateConfig::default(),
            Arc::clone(&self.limiter),
            self.sink.clone(),
        )
    }
}

#[tokio::test]
async fn sixth_request_in_a_minute_is_denied_until_rollover() {
    let harness = Harness::new();
    let id = caller("quota");

    for _ in 0..5 {
        let result = harness.limiter.check(&id, "ai_generation").await;
        assert!(result.allowed);
    }

    let denied = harness.limiter.check(&id, "ai_generation").await;
    assert_eq!(denied.verdict, Verdict::RateLimited);
    assert_eq!(denied.tier, Some(Tier::Minute));
    let retry_after = denied.retry_after.unwrap();
    assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(60));

    harness.clock.advance_secs(retry_after.as_secs() as i64);
    let next = harness.limiter.check(&id, "ai_generation").await;
    assert!(next.allowed);
    assert_eq!(next.remaining, 4);
}

#[tokio::test]
async fn concurrent_checks_never_exceed_the_quota() {
    let harness = Harness::new();
    let id = caller("racer");

    let results = join_all((0..40).map(|_| harness.limiter.check(&id, "ai_generation"))).await;
    let allowed = results.iter().filter(|r| r.allowed).count();

    assert_eq!(allowed, 5);
    assert_eq!(
        harness
            .limiter
            .usage(&id, "ai_generation", Tier::Minute)
            .await
            .unwrap(),
        40
    );
    assert_eq!(harness.limiter.metrics().fail_open(), 0);
}

#[tokio::test]
async fn checks_only_touch_counters() {
    let harness = Harness::new();
    let id = caller("reader");
    let pipeline = harness.pipeline();

    for _ in 0..3 {
        harness.limiter.check(&id, "search").await;
    }

    assert!(harness.limiter.restriction(&id).await.unwrap().is_none());
    assert_eq!(harness.limiter.usage(&id, "search", Tier::Hour).await.unwrap(), 3);
    assert!(pipeline.profiles().is_empty());
    assert_eq!(pipeline.standing(&id), CallerState::Clean);
    assert!(harness.sink.records().is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn cold_caller_never_raises_anomalies() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();

    for i in 0..20 {
        pipeline.record_outcome(request("newcomer", NOW - 20 + i, 500, 10_000_000));
    }
    pipeline.shutdown().await;

    assert!(harness.sink.anomalies().is_empty());
    assert_eq!(pipeline.standing(&caller("newcomer")), CallerState::Clean);
}

#[tokio::test]
async fn error_burst_after_low_error_baseline_is_suspicious() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();

    for event in warm_up("steady") {
        pipeline.record_outcome(event);
    }
    pipeline.record_outcome(request("steady", NOW, 503, 1_024));
    pipeline.shutdown().await;

    let anomalies = harness.sink.anomalies();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::ErrorSpike);
    assert!(anomalies[0].severity >= Severity::High);
    assert!(anomalies[0].severity < Severity::Critical);

    assert_eq!(pipeline.standing(&caller("steady")), CallerState::Suspicious);
    let decisions = harness.sink.decisions();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].action, FraudAction::Alert);

    // Suspicion alone does not restrict the caller.
    assert!(harness.limiter.check(&caller("steady"), "ai_generation").await.allowed);
}

#[tokio::test]
async fn critical_anomaly_blocks_until_expiry_and_keeps_profile() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let id = caller("exfil");

    for event in warm_up("exfil") {
        pipeline.record_outcome(event);
    }
    pipeline.record_outcome(request("exfil", NOW, 200, 1_024 * 100));
    pipeline.shutdown().await;

    let anomalies = harness.sink.anomalies();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].severity, Severity::Critical);
    assert_eq!(pipeline.standing(&id), CallerState::Blocked);
    assert_eq!(pipeline.metrics().snapshot().enforcement_actions, 1);

    let blocked = harness.limiter.check(&id, "ai_generation").await;
    assert_eq!(blocked.verdict, Verdict::Restricted);
    assert_eq!(blocked.retry_after, Some(Duration::from_secs(3_600)));
    assert_eq!(
        harness
            .limiter
            .usage(&id, "ai_generation", Tier::Minute)
            .await
            .unwrap(),
        0
    );

    let before = pipeline.profiles().get(&id).unwrap();

    harness.clock.advance_secs(3_600);
    let after = harness.limiter.check(&id, "ai_generation").await;
    assert!(after.allowed);
    assert_eq!(pipeline.standing(&id), CallerState::Clean);

    let profile = pipeline.profiles().get(&id).unwrap();
    assert_eq!(profile.sample_count, 51);
    assert_eq!(profile.as_ref(), before.as_ref());
}

#[tokio::test]
async fn throttle_entry_reduces_limits() {
    let harness = Harness::new();
    let id = caller("throttled");

    harness
        .limiter
        .restrict(&id, BlockEntry::throttle(at(NOW + 900), "manual"))
        .await
        .unwrap();

    // 5 / 4 rounds down to one request per minute.
    assert!(harness.limiter.check(&id, "ai_generation").await.allowed);
    let second = harness.limiter.check(&id, "ai_generation").await;
    assert_eq!(second.verdict, Verdict::RateLimited);
    assert_eq!(second.limit, 1);
}

/// Store double that fails every call.
struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn increment(&self, _key: &WindowKey, _ttl: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn peek(&self, _key: &WindowKey) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl BlockList for FailingStore {
    async fn restrict(&self, _caller: &CallerId, _entry: BlockEntry) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn lookup(
        &self,
        _caller: &CallerId,
        _now: DateTime<Utc>,
    ) -> Result<Option<BlockEntry>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn lift(&self, _caller: &CallerId) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn unavailable_store_fails_open_with_diagnostic() {
    let clock = MockClock::at_unix(NOW);
    let sink = Arc::new(CollectingSink::new());
    let limiter = RateLimiter::new(Arc::new(FailingStore), ai_rules())
        .with_clock(Arc::new(clock))
        .with_sink(sink.clone())
        .with_settings(LimiterSettings {
            retry_backoff: Duration::from_millis(1),
            ..LimiterSettings::default()
        });
    let id = caller("unlucky");

    for _ in 0..10 {
        let result = limiter.check(&id, "ai_generation").await;
        assert!(result.allowed);
        assert!(result.degraded);
        assert_eq!(result.verdict, Verdict::Allowed);
    }

    assert_eq!(limiter.metrics().fail_open(), 10);
    assert!(limiter.metrics().snapshot().is_degraded());
    let diagnostics = sink.diagnostics();
    assert_eq!(diagnostics.len(), 10);
    assert!(diagnostics
        .iter()
        .all(|d| d.kind == DiagnosticKind::StoreFailOpen));
}

#[tokio::test]
async fn failed_enforcement_is_reported() {
    let clock = MockClock::at_unix(NOW);
    let sink = Arc::new(CollectingSink::new());
    let limiter = Arc::new(
        RateLimiter::new(Arc::new(FailingStore), ai_rules())
            .with_clock(Arc::new(clock))
            .with_sink(sink.clone())
            .with_settings(LimiterSettings {
                retry_backoff: Duration::from_millis(1),
                ..LimiterSettings::default()
            }),
    );
    let pipeline = SecurityPipeline::start(&TollgateConfig::default(), limiter, sink.clone());

    for event in warm_up("evader") {
        pipeline.record_outcome(event);
    }
    pipeline.record_outcome(request("evader", NOW, 200, 1_024 * 100));
    pipeline.shutdown().await;

    assert_eq!(pipeline.standing(&caller("evader")), CallerState::Blocked);
    assert!(sink
        .diagnostics()
        .iter()
        .any(|d| d.kind == DiagnosticKind::EnforcementFailed));
}
