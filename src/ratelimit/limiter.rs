//! Multi-tier rate limiter over the shared counter store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::rules::ClassRules;
use super::window::{Tier, WindowKey};
use crate::caller::CallerId;
use crate::clock::{Clock, SystemClock};
use crate::config::TollgateConfig;
use crate::metrics::Metrics;
use crate::sink::{Diagnostic, DiagnosticKind, EventSink, SecurityRecord, TracingSink};
use crate::store::{BlockEntry, BlockKind, SharedStore, StoreError};

/// How a check was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Within every tier's quota.
    Allowed,
    /// At least one tier's quota is exhausted (429-equivalent).
    RateLimited,
    /// The caller is temporarily blocked by the fraud engine.
    Restricted,
}

/// Outcome of [`RateLimiter::check`]. A denial is a value, never an error.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left in the reported tier's current window.
    pub remaining: u64,
    /// The reported tier's limit, after any throttle.
    pub limit: u64,
    /// When the reported tier's window (or the block) ends.
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying. Set only on denial.
    pub retry_after: Option<Duration>,
    pub verdict: Verdict,
    /// The tier the numbers above describe.
    pub tier: Option<Tier>,
    /// The counter store failed and the check was allowed without full counting.
    pub degraded: bool,
}

impl RateLimitResult {
    fn unlimited(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            limit: u64::MAX,
            reset_at: now,
            retry_after: None,
            verdict: Verdict::Allowed,
            tier: None,
            degraded: false,
        }
    }

    fn restricted(entry: &BlockEntry, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit: 0,
            reset_at: entry.expires_at,
            retry_after: Some(entry.remaining(now)),
            verdict: Verdict::Restricted,
            tier: None,
            degraded: false,
        }
    }

    /// Combine per-tier statuses: deny if any tier denies.
    ///
    /// On denial the denying tier with the earliest reset is reported, so the
    /// caller retries as early as is correct. On success the tier with the
    /// least headroom is reported.
    fn from_statuses(statuses: &[TierStatus], now: DateTime<Utc>, degraded: bool) -> Self {
        let denying = statuses
            .iter()
            .filter(|s| s.exceeded())
            .min_by_key(|s| (s.reset_at, s.tier));

        if let Some(status) = denying {
            return Self {
                allowed: false,
                remaining: 0,
                limit: status.limit,
                reset_at: status.reset_at,
                retry_after: Some((status.reset_at - now).to_std().unwrap_or(Duration::ZERO)),
                verdict: Verdict::RateLimited,
                tier: Some(status.tier),
                degraded,
            };
        }

        match statuses
            .iter()
            .min_by_key(|s| (s.remaining(), s.reset_at, s.tier))
        {
            Some(status) => Self {
                allowed: true,
                remaining: status.remaining(),
                limit: status.limit,
                reset_at: status.reset_at,
                retry_after: None,
                verdict: Verdict::Allowed,
                tier: Some(status.tier),
                degraded,
            },
            None => Self {
                degraded,
                ..Self::unlimited(now)
            },
        }
    }
}

/// Count observed for one tier during a check.
#[derive(Debug, Clone, Copy)]
struct TierStatus {
    tier: Tier,
    limit: u64,
    /// `None` when the store failed and the tier failed open.
    count: Option<u64>,
    reset_at: DateTime<Utc>,
}

impl TierStatus {
    fn exceeded(&self) -> bool {
        self.count.is_some_and(|count| count > self.limit)
    }

    fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count.unwrap_or(0))
    }
}

/// Tunables for the limiter, usually derived from [`TollgateConfig`].
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// When false every check is allowed without counting.
    pub enabled: bool,
    /// Extra TTL on counters beyond the window length.
    pub grace: Duration,
    /// Limits are divided by this while a caller is throttled.
    pub throttle_divisor: u64,
    /// Deadline for each store call.
    pub store_timeout: Duration,
    /// Delay before the single retry of a failed store call.
    pub retry_backoff: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            grace: Duration::from_secs(5),
            throttle_divisor: 4,
            store_timeout: Duration::from_millis(25),
            retry_backoff: Duration::from_millis(5),
        }
    }
}

impl LimiterSettings {
    pub fn from_config(config: &TollgateConfig) -> Self {
        Self {
            enabled: config.rate_limiting.enabled,
            grace: Duration::from_secs(config.rate_limiting.grace_secs),
            throttle_divisor: config.rate_limiting.throttle_divisor,
            store_timeout: Duration::from_millis(config.store.timeout_ms),
            retry_backoff: Duration::from_millis(config.store.retry_backoff_ms),
        }
    }
}

/// Multi-tier rate limiter.
///
/// Thread-safe and cheap to share behind an `Arc`. No lock is held across
/// store I/O; all state lives in the store, keyed by caller.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    rules: ClassRules,
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    metrics: Metrics,
}

impl RateLimiter {
    /// Create a rate limiter with default settings.
    pub fn new(store: Arc<dyn SharedStore>, rules: ClassRules) -> Self {
        Self {
            store,
            rules,
            settings: LimiterSettings::default(),
            clock: Arc::new(SystemClock::new()),
            sink: Arc::new(TracingSink),
            metrics: Metrics::new(),
        }
    }

    /// Create a rate limiter from the service configuration.
    pub fn from_config(store: Arc<dyn SharedStore>, config: &TollgateConfig) -> Self {
        Self::new(store, config.rate_limiting.classes.clone())
            .with_settings(LimiterSettings::from_config(config))
    }

    pub fn with_settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Check and count one request from `caller` against `endpoint_class`.
    ///
    /// Every enforced tier is incremented exactly once, including when the
    /// request ends up denied. Blocked callers are refused before anything is
    /// counted. Store failures are retried once and then fail open.
    pub async fn check(&self, caller: &CallerId, endpoint_class: &str) -> RateLimitResult {
        let now = self.clock.now();
        if !self.settings.enabled {
            return RateLimitResult::unlimited(now);
        }

        let Some((scope, limits)) = self.rules.resolve(endpoint_class) else {
            return RateLimitResult::unlimited(now);
        };

        trace!(caller = %caller, class = %endpoint_class, scope = %scope, "Checking rate limit");

        let mut failure: Option<StoreError> = None;

        let restriction = match self.guarded(|| self.store.lookup(caller, now)).await {
            Ok(entry) => entry,
            Err(err) => {
                failure = Some(err);
                None
            }
        };

        let divisor = match &restriction {
            Some(entry) if entry.kind == BlockKind::Block => {
                debug!(caller = %caller, until = %entry.expires_at, "Caller is blocked");
                self.metrics.record_restricted();
                return RateLimitResult::restricted(entry, now);
            }
            Some(_) => self.settings.throttle_divisor.max(1),
            None => 1,
        };

        let counts = join_all(limits.enforced().into_iter().map(|(tier, limit)| async move {
            let key = WindowKey::at(caller, scope, tier, now);
            let ttl = tier.ttl(self.settings.grace);
            let count = self.guarded(|| self.store.increment(&key, ttl)).await;
            (tier, (limit / divisor).max(1), count)
        }))
        .await;

        let mut statuses = Vec::with_capacity(counts.len());
        for (tier, limit, count) in counts {
            let count = match count {
                Ok(count) => Some(count),
                Err(err) => {
                    failure = Some(err);
                    None
                }
            };
            statuses.push(TierStatus {
                tier,
                limit,
                count,
                reset_at: tier.reset_at(now),
            });
        }

        let degraded = failure.is_some();
        if let Some(err) = failure {
            self.report_fail_open(caller, &err, now);
        }

        let result = RateLimitResult::from_statuses(&statuses, now, degraded);
        match result.verdict {
            Verdict::Allowed => self.metrics.record_allowed(),
            _ => {
                debug!(
                    caller = %caller,
                    tier = ?result.tier,
                    retry_after = ?result.retry_after,
                    "Rate limit exceeded"
                );
                self.metrics.record_rate_limited();
            }
        }
        result
    }

    /// Place a block or throttle on a caller.
    pub async fn restrict(&self, caller: &CallerId, entry: BlockEntry) -> Result<(), StoreError> {
        debug!(caller = %caller, kind = ?entry.kind, until = %entry.expires_at, "Restricting caller");
        self.guarded(|| self.store.restrict(caller, entry.clone())).await
    }

    /// Remove any block or throttle on a caller.
    pub async fn lift(&self, caller: &CallerId) -> Result<(), StoreError> {
        self.guarded(|| self.store.lift(caller)).await
    }

    /// The caller's current restriction, if any.
    pub async fn restriction(&self, caller: &CallerId) -> Result<Option<BlockEntry>, StoreError> {
        let now = self.clock.now();
        self.guarded(|| self.store.lookup(caller, now)).await
    }

    /// Whether the caller is currently refused outright. An unreachable
    /// store reads as not blocked.
    pub async fn blocked(&self, caller: &CallerId) -> bool {
        match self.restriction(caller).await {
            Ok(entry) => entry.is_some_and(|entry| entry.kind == BlockKind::Block),
            Err(err) => {
                debug!(caller = %caller, error = %err, "Block lookup failed");
                false
            }
        }
    }

    /// Current count for a caller's tier window without counting a request.
    pub async fn usage(
        &self,
        caller: &CallerId,
        endpoint_class: &str,
        tier: Tier,
    ) -> Result<u64, StoreError> {
        let Some((scope, _)) = self.rules.resolve(endpoint_class) else {
            return Ok(0);
        };
        let key = WindowKey::at(caller, scope, tier, self.clock.now());
        self.guarded(|| self.store.peek(&key)).await
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn rules(&self) -> &ClassRules {
        &self.rules
    }

    /// Run a store operation with a deadline, retrying once after a short backoff.
    async fn guarded<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.attempt(op()).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(error = %err, "Counter store call failed, retrying once");
                self.metrics.record_store_retry();
                tokio::time::sleep(self.backoff()).await;
                self.attempt(op()).await
            }
        }
    }

    async fn attempt<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.settings.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.settings.store_timeout)),
        }
    }

    fn backoff(&self) -> Duration {
        let base = self.settings.retry_backoff;
        let jitter_ms = (base.as_millis() as u64) / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn report_fail_open(&self, caller: &CallerId, err: &StoreError, now: DateTime<Utc>) {
        warn!(caller = %caller, error = %err, "Counter store unavailable, failing open");
        self.metrics.record_fail_open();
        self.sink.publish(SecurityRecord::Diagnostic(Diagnostic::new(
            DiagnosticKind::StoreFailOpen,
            Some(caller),
            err.to_string(),
            now,
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::TierLimits;
    use crate::store::{BlockList, CounterStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MIDNIGHT: i64 = 1_704_067_200;

    fn setup(limits: TierLimits) -> (RateLimiter, MemoryStore, MockClock) {
        let clock = MockClock::at_unix(MIDNIGHT);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let rules = ClassRules::default().with_class("default", limits);
        let limiter = RateLimiter::new(Arc::new(store.clone()), rules)
            .with_clock(Arc::new(clock.clone()));
        (limiter, store, clock)
    }

    fn caller(id: &str) -> CallerId {
        CallerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_check_counts_every_tier() {
        let (limiter, store, clock) = setup(TierLimits::new(Some(10), Some(100), None));
        let alice = caller("alice");

        let result = limiter.check(&alice, "default").await;
        assert!(result.allowed);
        assert_eq!(result.verdict, Verdict::Allowed);
        assert_eq!(result.tier, Some(Tier::Minute));
        assert_eq!(result.remaining, 9);

        for tier in [Tier::Minute, Tier::Hour] {
            let key = WindowKey::at(&alice, "default", tier, clock.now());
            assert_eq!(store.peek(&key).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_sixth_request_denied_then_allowed_after_rollover() {
        let (limiter, _, clock) = setup(TierLimits::new(Some(5), Some(100), None));
        let bob = caller("bob");

        for i in 1..=5 {
            let result = limiter.check(&bob, "default").await;
            assert!(result.allowed, "Request {} should be allowed", i);
        }

        let denied = limiter.check(&bob, "default").await;
        assert!(!denied.allowed);
        assert_eq!(denied.verdict, Verdict::RateLimited);
        assert_eq!(denied.tier, Some(Tier::Minute));
        assert!(denied.retry_after.unwrap() <= Duration::from_secs(60));

        clock.advance_secs(60);
        let result = limiter.check(&bob, "default").await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_denied_request_still_counts() {
        let (limiter, _, _) = setup(TierLimits::new(Some(1), Some(100), None));
        let carol = caller("carol");

        for _ in 0..3 {
            limiter.check(&carol, "default").await;
        }

        assert_eq!(limiter.usage(&carol, "default", Tier::Minute).await.unwrap(), 3);
        assert_eq!(limiter.usage(&carol, "default", Tier::Hour).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tie_break_reports_earliest_reset() {
        let (limiter, _, clock) = setup(TierLimits::new(Some(1), Some(1), None));
        let dave = caller("dave");

        clock.advance_secs(30);
        limiter.check(&dave, "default").await;
        let denied = limiter.check(&dave, "default").await;

        assert_eq!(denied.tier, Some(Tier::Minute));
        assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_longer_tier_denies_alone() {
        let (limiter, _, clock) = setup(TierLimits::new(Some(10), Some(2), None));
        let erin = caller("erin");

        limiter.check(&erin, "default").await;
        limiter.check(&erin, "default").await;
        let denied = limiter.check(&erin, "default").await;

        assert_eq!(denied.tier, Some(Tier::Hour));
        let expected = Tier::Hour.reset_at(clock.now()) - clock.now();
        assert_eq!(denied.retry_after, Some(expected.to_std().unwrap()));
    }

    #[tokio::test]
    async fn test_blocked_caller_restricted_without_counting() {
        let (limiter, _, clock) = setup(TierLimits::new(Some(10), None, None));
        let frank = caller("frank");
        let until = clock.now() + chrono::Duration::seconds(120);

        limiter
            .restrict(&frank, BlockEntry::block(until, "test"))
            .await
            .unwrap();

        let result = limiter.check(&frank, "default").await;
        assert!(!result.allowed);
        assert_eq!(result.verdict, Verdict::Restricted);
        assert_eq!(result.retry_after, Some(Duration::from_secs(120)));
        assert_eq!(limiter.usage(&frank, "default", Tier::Minute).await.unwrap(), 0);
        assert!(limiter.blocked(&frank).await);

        clock.advance_secs(120);
        assert!(!limiter.blocked(&frank).await);
        assert!(limiter.check(&frank, "default").await.allowed);
    }

    #[tokio::test]
    async fn test_throttle_divides_limits() {
        let (limiter, _, clock) = setup(TierLimits::new(Some(8), None, None));
        let gina = caller("gina");
        let until = clock.now() + chrono::Duration::seconds(300);

        limiter
            .restrict(&gina, BlockEntry::throttle(until, "test"))
            .await
            .unwrap();

        for _ in 0..2 {
            assert!(limiter.check(&gina, "default").await.allowed);
        }
        let denied = limiter.check(&gina, "default").await;
        assert_eq!(denied.verdict, Verdict::RateLimited);
        assert_eq!(denied.limit, 2);
    }

    #[tokio::test]
    async fn test_classes_have_separate_counters() {
        let (limiter, _, _) = setup(TierLimits::new(Some(1), None, None));
        let limiter = RateLimiter {
            rules: limiter
                .rules
                .clone()
                .with_class("ai_generation", TierLimits::new(Some(1), None, None)),
            ..limiter
        };
        let hana = caller("hana");

        assert!(limiter.check(&hana, "default").await.allowed);
        assert!(limiter.check(&hana, "ai_generation").await.allowed);
        assert!(!limiter.check(&hana, "default").await.allowed);
        // Unknown classes share the default scope.
        assert!(!limiter.check(&hana, "image_search").await.allowed);
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let (limiter, _, _) = setup(TierLimits::new(Some(1), None, None));
        let limiter = limiter.with_settings(LimiterSettings {
            enabled: false,
            ..LimiterSettings::default()
        });
        let ivan = caller("ivan");

        for _ in 0..5 {
            assert!(limiter.check(&ivan, "default").await.allowed);
        }
        assert_eq!(limiter.metrics().snapshot().checks_allowed, 0);
    }

    /// Counter store whose increments fail or hang a set number of times.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
        hangs: AtomicUsize,
    }

    impl FlakyStore {
        fn new(clock: &MockClock, failures: usize, hangs: usize) -> Self {
            Self {
                inner: MemoryStore::with_clock(Arc::new(clock.clone())),
                failures: AtomicUsize::new(failures),
                hangs: AtomicUsize::new(hangs),
            }
        }
    }

    fn take(remaining: &AtomicUsize) -> bool {
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn increment(&self, key: &WindowKey, ttl: Duration) -> Result<u64, StoreError> {
            if take(&self.failures) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            if take(&self.hangs) {
                std::future::pending::<()>().await;
            }
            self.inner.increment(key, ttl).await
        }

        async fn peek(&self, key: &WindowKey) -> Result<u64, StoreError> {
            self.inner.peek(key).await
        }
    }

    #[async_trait]
    impl BlockList for FlakyStore {
        async fn restrict(&self, caller: &CallerId, entry: BlockEntry) -> Result<(), StoreError> {
            self.inner.restrict(caller, entry).await
        }

        async fn lookup(
            &self,
            caller: &CallerId,
            now: DateTime<Utc>,
        ) -> Result<Option<BlockEntry>, StoreError> {
            self.inner.lookup(caller, now).await
        }

        async fn lift(&self, caller: &CallerId) -> Result<(), StoreError> {
            self.inner.lift(caller).await
        }
    }

    fn flaky_limiter(failures: usize, hangs: usize) -> RateLimiter {
        let clock = MockClock::at_unix(MIDNIGHT);
        let store = FlakyStore::new(&clock, failures, hangs);
        let rules = ClassRules::default()
            .with_class("default", TierLimits::new(Some(5), None, None));
        RateLimiter::new(Arc::new(store), rules).with_clock(Arc::new(clock))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_call_recovers_on_retry() {
        let limiter = flaky_limiter(1, 0);
        let jane = caller("jane");

        let result = limiter.check(&jane, "default").await;
        assert!(result.allowed);
        assert!(!result.degraded);
        assert_eq!(result.remaining, 4);

        let metrics = limiter.metrics().snapshot();
        assert_eq!(metrics.store_retries, 1);
        assert_eq!(metrics.fail_open, 0);
        assert_eq!(limiter.usage(&jane, "default", Tier::Minute).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_and_retries() {
        let limiter = flaky_limiter(0, 1);
        let kim = caller("kim");

        let started = tokio::time::Instant::now();
        let result = limiter.check(&kim, "default").await;
        let elapsed = started.elapsed();

        assert!(result.allowed);
        assert!(!result.degraded);
        assert_eq!(result.remaining, 4);
        // One timeout plus the jittered backoff.
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed <= Duration::from_millis(40));
        assert_eq!(limiter.metrics().snapshot().store_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_timeout_fails_open() {
        let limiter = flaky_limiter(0, 2);
        let lee = caller("lee");

        let result = limiter.check(&lee, "default").await;
        assert!(result.allowed);
        assert!(result.degraded);

        let metrics = limiter.metrics().snapshot();
        assert_eq!(metrics.store_retries, 1);
        assert_eq!(metrics.fail_open, 1);
        assert_eq!(limiter.usage(&lee, "default", Tier::Minute).await.unwrap(), 0);
    }
}
