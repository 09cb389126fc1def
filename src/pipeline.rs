//! Asynchronous security pipeline.
//!
//! Request outcomes are routed by caller to one of several bounded queues.
//! Each queue has a single worker that runs profile update, anomaly
//! detection, fraud evaluation and enforcement for the callers it owns, so a
//! caller's events are always processed in arrival order. A full queue drops
//! the event instead of slowing the request path.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::caller::{CallerId, RequestEvent};
use crate::config::TollgateConfig;
use crate::detect::{AnomalyDetector, AnomalyEvent};
use crate::fraud::{CallerState, FraudAction, FraudDecision, FraudEngine};
use crate::metrics::Metrics;
use crate::profile::{ProfileParams, ProfileStore};
use crate::ratelimit::RateLimiter;
use crate::sink::{Diagnostic, DiagnosticKind, EventSink, SecurityRecord};
use crate::store::BlockEntry;

/// Fire-and-forget entry point for request outcomes.
pub struct SecurityPipeline {
    senders: RwLock<Vec<mpsc::Sender<RequestEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
    profiles: Arc<ProfileStore>,
    engine: Arc<FraudEngine>,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn EventSink>,
    metrics: Metrics,
}

impl SecurityPipeline {
    /// Build the pipeline and spawn its workers and reapers.
    ///
    /// Shares the limiter's clock and metrics. Must be called within a Tokio
    /// runtime.
    pub fn start(
        config: &TollgateConfig,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let clock = Arc::clone(limiter.clock());
        let metrics = limiter.metrics().clone();

        let profiles = Arc::new(
            ProfileStore::new(ProfileParams::from_config(&config.profile))
                .with_sink(Arc::clone(&sink)),
        );
        let detector = AnomalyDetector::new(&config.anomaly);
        let engine = Arc::new(FraudEngine::new(&config.fraud).with_clock(Arc::clone(&clock)));

        let sweep_interval = Duration::from_secs(config.profile.reaper_interval_secs.max(1));
        let workers = config.pipeline.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (sender, receiver) = mpsc::channel(config.pipeline.queue_capacity.max(1));
            let worker = Worker {
                profiles: Arc::clone(&profiles),
                detector: detector.clone(),
                engine: Arc::clone(&engine),
                limiter: Arc::clone(&limiter),
                sink: Arc::clone(&sink),
                metrics: metrics.clone(),
                histories: HashMap::new(),
                max_history: config.fraud.max_history.max(1),
                sweep_interval,
            };
            senders.push(sender);
            handles.push(tokio::spawn(worker.run(index, receiver)));
        }

        let reapers = vec![
            Arc::clone(&profiles).spawn_reaper(
                clock,
                sweep_interval,
                Duration::from_secs(config.profile.idle_eviction_secs),
            ),
            Arc::clone(&engine).spawn_reaper(sweep_interval),
        ];

        info!(
            workers,
            queue_capacity = config.pipeline.queue_capacity,
            "Security pipeline started"
        );

        Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(handles),
            reapers: Mutex::new(reapers),
            profiles,
            engine,
            limiter,
            sink,
            metrics,
        }
    }

    /// Queue a request outcome for profiling. Never blocks.
    ///
    /// When the caller's queue is full, or the pipeline has shut down, the
    /// event is dropped and counted.
    pub fn record_outcome(&self, event: RequestEvent) {
        let senders = self.senders.read();
        if senders.is_empty() {
            drop(senders);
            self.dropped(&event, "pipeline is shut down");
            return;
        }

        let shard = shard_for(&event.caller_id, senders.len());
        match senders[shard].try_send(event) {
            Ok(()) => self.metrics.record_event_accepted(),
            Err(TrySendError::Full(event)) => {
                drop(senders);
                self.dropped(&event, "profiling queue full");
            }
            Err(TrySendError::Closed(event)) => {
                drop(senders);
                self.dropped(&event, "profiling worker stopped");
            }
        }
    }

    /// The caller's escalation state.
    pub fn standing(&self, caller: &CallerId) -> CallerState {
        self.engine.standing(caller)
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Close every queue and wait for the workers to finish what was queued.
    pub async fn shutdown(&self) {
        let senders = std::mem::take(&mut *self.senders.write());
        drop(senders);

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Profiling worker ended abnormally");
            }
        }

        for reaper in std::mem::take(&mut *self.reapers.lock()) {
            reaper.abort();
        }

        info!("Security pipeline stopped");
    }

    fn dropped(&self, event: &RequestEvent, reason: &str) {
        self.metrics.record_event_dropped();
        debug!(caller = %event.caller_id, reason, "Request outcome dropped");
        self.sink.publish(SecurityRecord::Diagnostic(Diagnostic::new(
            DiagnosticKind::EventDropped,
            Some(&event.caller_id),
            reason,
            self.limiter.clock().now(),
        )));
    }
}

impl std::fmt::Debug for SecurityPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPipeline")
            .field("queues", &self.senders.read().len())
            .field("profiles", &self.profiles.len())
            .finish_non_exhaustive()
    }
}

fn shard_for(caller: &CallerId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    caller.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Owns the anomaly histories of the callers routed to one queue.
struct Worker {
    profiles: Arc<ProfileStore>,
    detector: AnomalyDetector,
    engine: Arc<FraudEngine>,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn EventSink>,
    metrics: Metrics,
    histories: HashMap<CallerId, VecDeque<AnomalyEvent>>,
    max_history: usize,
    sweep_interval: Duration,
}

impl Worker {
    #[instrument(name = "profiling_worker", skip(self, receiver))]
    async fn run(mut self, index: usize, mut receiver: mpsc::Receiver<RequestEvent>) {
        debug!("Profiling worker started");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        loop {
            tokio::select! {
                event = receiver.recv() => match event {
                    Some(event) => self.process(event).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    let now = self.limiter.clock().now();
                    self.evict_idle_histories(now);
                }
            }
        }
        debug!(callers = self.histories.len(), "Profiling worker drained");
    }

    async fn process(&mut self, event: RequestEvent) {
        let caller = event.caller_id.clone();
        let profile = self.profiles.update(&event);
        let anomaly = self.detector.evaluate(&profile, &event);

        if let Some(anomaly) = &anomaly {
            self.metrics.record_anomaly();
            self.sink.publish(SecurityRecord::Anomaly(anomaly.clone()));
        }

        let flagged = anomaly.is_some();
        let decision = self.decide(&caller, anomaly);

        // Quiet events that leave the standing unchanged need no follow-up.
        if decision.is_transition() || flagged {
            self.sink.publish(SecurityRecord::Decision(decision.clone()));
            self.enforce(&decision).await;
        }
    }

    /// Record the anomaly, if any, prune the caller's history and decide.
    fn decide(&mut self, caller: &CallerId, anomaly: Option<AnomalyEvent>) -> FraudDecision {
        let now = self.limiter.clock().now();
        let horizon = now - self.engine.longest_window();

        let history = self.histories.entry(caller.clone()).or_default();
        if let Some(anomaly) = anomaly {
            history.push_back(anomaly);
        }
        while history.len() > self.max_history {
            history.pop_front();
        }
        while history.front().is_some_and(|oldest| oldest.timestamp < horizon) {
            history.pop_front();
        }

        let decision = self.engine.decide(caller, history.make_contiguous());
        if history.is_empty() {
            self.histories.remove(caller);
        }
        decision
    }

    /// Drop histories whose newest anomaly is older than any rule window.
    fn evict_idle_histories(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = now - self.engine.longest_window();
        let before = self.histories.len();
        self.histories
            .retain(|_, history| history.back().is_some_and(|newest| newest.timestamp >= horizon));
        let removed = before - self.histories.len();
        if removed > 0 {
            debug!(removed, "Evicted idle anomaly histories");
        }
        removed
    }

    async fn enforce(&self, decision: &FraudDecision) {
        let caller = &decision.caller_id;

        if decision.is_transition()
            && decision.previous_state == CallerState::Restricted
            && decision.state == CallerState::Clean
        {
            if let Err(e) = self.limiter.lift(caller).await {
                warn!(caller = %caller, error = %e, "Failed to lift throttle");
            }
            return;
        }

        let entry = match (decision.action, decision.expires_at) {
            (FraudAction::Block, Some(until)) => BlockEntry::block(until, decision.reason.clone()),
            (FraudAction::Throttle, Some(until)) => {
                BlockEntry::throttle(until, decision.reason.clone())
            }
            _ => return,
        };

        match self.limiter.restrict(caller, entry).await {
            Ok(()) => self.metrics.record_enforcement(),
            Err(e) => {
                warn!(caller = %caller, action = ?decision.action, error = %e, "Failed to enforce decision");
                self.sink.publish(SecurityRecord::Diagnostic(Diagnostic::new(
                    DiagnosticKind::EnforcementFailed,
                    Some(caller),
                    e.to_string(),
                    decision.decided_at,
                )));
            }
        }
    }
}
