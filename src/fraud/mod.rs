//! Fraud rule engine and per-caller escalation.
//!
//! Callers move `Clean -> Suspicious -> Restricted -> Blocked` one step per
//! decision while rules keep matching. A critical anomaly is the only way to
//! skip straight to `Blocked`. Suspicious and restricted callers fall back to
//! `Clean` after a quiet cool-down; blocked callers only once the block
//! expires. Either reset discards the anomaly history that led to it.

mod rules;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::caller::CallerId;
use crate::clock::{Clock, SystemClock};
use crate::config::FraudConfig;
use crate::detect::AnomalyEvent;

use rules::clamped_seconds;
pub use rules::{validate_rules, RuleConfig};

/// Escalation state of a caller.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CallerState {
    #[default]
    Clean,
    Suspicious,
    Restricted,
    Blocked,
}

impl CallerState {
    /// The state one step up, saturating at `Blocked`.
    pub fn escalate(self) -> Self {
        match self {
            CallerState::Clean => CallerState::Suspicious,
            CallerState::Suspicious => CallerState::Restricted,
            CallerState::Restricted | CallerState::Blocked => CallerState::Blocked,
        }
    }
}

impl fmt::Display for CallerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallerState::Clean => "clean",
            CallerState::Suspicious => "suspicious",
            CallerState::Restricted => "restricted",
            CallerState::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

/// What enforcement a decision calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FraudAction {
    None,
    Log,
    Alert,
    Throttle,
    Block,
}

impl FraudAction {
    fn for_state(state: CallerState, matched: bool) -> Self {
        match state {
            CallerState::Clean if matched => FraudAction::Log,
            CallerState::Clean => FraudAction::None,
            CallerState::Suspicious => FraudAction::Alert,
            CallerState::Restricted => FraudAction::Throttle,
            CallerState::Blocked => FraudAction::Block,
        }
    }

    /// Whether the action writes a block list entry.
    pub fn is_enforcing(&self) -> bool {
        matches!(self, FraudAction::Throttle | FraudAction::Block)
    }
}

/// Outcome of evaluating a caller's anomaly history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudDecision {
    pub caller_id: CallerId,
    pub previous_state: CallerState,
    pub state: CallerState,
    pub action: FraudAction,
    /// Ids of the rules that matched, in configuration order.
    pub matched_rules: Vec<String>,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
    /// When a throttle or block lapses.
    pub expires_at: Option<DateTime<Utc>>,
}

impl FraudDecision {
    /// Whether the caller's state changed.
    pub fn is_transition(&self) -> bool {
        self.state != self.previous_state
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Standing {
    state: CallerState,
    /// When the current block lapses.
    blocked_until: Option<DateTime<Utc>>,
    /// Anomalies before this instant no longer count.
    reset_at: Option<DateTime<Utc>>,
    last_decision: Option<DateTime<Utc>>,
}

impl Standing {
    /// Whether forgetting this standing would leave every later decision
    /// unchanged, given that anomalies older than `retention` are pruned.
    fn is_settled(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.state {
            CallerState::Clean => self.reset_at.map_or(true, |reset| now - reset >= retention),
            CallerState::Blocked => self
                .blocked_until
                .is_some_and(|until| now - until >= retention),
            CallerState::Suspicious | CallerState::Restricted => self
                .last_decision
                .map_or(true, |last| now - last >= retention),
        }
    }
}

/// Evaluates configured rules and tracks each caller's standing.
///
/// Performs no I/O. Enforcement of block and throttle decisions is left to
/// the caller. Only callers whose standing still influences a decision are
/// tracked.
pub struct FraudEngine {
    rules: Vec<RuleConfig>,
    block_duration: Duration,
    throttle_duration: Duration,
    cool_down: Duration,
    retention: Duration,
    standings: DashMap<CallerId, Standing>,
    clock: Arc<dyn Clock>,
}

impl Default for FraudEngine {
    fn default() -> Self {
        Self::new(&FraudConfig::default())
    }
}

impl FraudEngine {
    pub fn new(config: &FraudConfig) -> Self {
        let cool_down = clamped_seconds(config.cool_down_secs);
        let longest_window = config
            .rules
            .iter()
            .filter_map(RuleConfig::window)
            .max()
            .unwrap_or(cool_down);

        Self {
            rules: config.rules.clone(),
            block_duration: clamped_seconds(config.block_duration_secs),
            throttle_duration: clamped_seconds(config.throttle_duration_secs),
            cool_down,
            retention: longest_window.max(cool_down),
            standings: DashMap::new(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rules(&self) -> &[RuleConfig] {
        &self.rules
    }

    /// Longest lookback of any windowed rule.
    pub fn longest_window(&self) -> Duration {
        self.rules
            .iter()
            .filter_map(RuleConfig::window)
            .max()
            .unwrap_or(self.cool_down)
    }

    /// Decide on `caller` at the current time.
    pub fn decide(&self, caller: &CallerId, history: &[AnomalyEvent]) -> FraudDecision {
        self.decide_at(caller, history, self.clock.now())
    }

    /// Decide on `caller` given its anomaly history as of `now`.
    ///
    /// For the same history, prior standing and `now` the decision is always
    /// the same.
    pub fn decide_at(
        &self,
        caller: &CallerId,
        history: &[AnomalyEvent],
        now: DateTime<Utc>,
    ) -> FraudDecision {
        let entry = self.standings.entry(caller.clone());
        let mut standing = match &entry {
            Entry::Occupied(occupied) => *occupied.get(),
            Entry::Vacant(_) => Standing::default(),
        };
        let previous_state = standing.state;

        let (state, matched, expires_at) = self.advance(caller, &mut standing, history, now);
        standing.last_decision = Some(now);

        if standing.is_settled(now, self.retention) {
            if let Entry::Occupied(occupied) = entry {
                occupied.remove();
            }
        } else {
            entry.insert(standing);
        }

        if state != previous_state {
            info!(
                caller = %caller,
                from = %previous_state,
                to = %state,
                rules = ?matched,
                "Caller standing changed"
            );
        }

        self.decision(caller, previous_state, state, matched, expires_at, now)
    }

    fn advance(
        &self,
        caller: &CallerId,
        standing: &mut Standing,
        history: &[AnomalyEvent],
        now: DateTime<Utc>,
    ) -> (CallerState, Vec<String>, Option<DateTime<Utc>>) {
        if let Some(until) = standing.blocked_until.filter(|until| *until <= now) {
            debug!(caller = %caller, "Block expired, caller reset to clean");
            *standing = Standing {
                state: CallerState::Clean,
                blocked_until: None,
                reset_at: Some(until),
                last_decision: standing.last_decision,
            };
        }

        let relevant: Vec<AnomalyEvent> = history
            .iter()
            .filter(|event| standing.reset_at.map_or(true, |reset| event.timestamp >= reset))
            .cloned()
            .collect();

        if matches!(standing.state, CallerState::Suspicious | CallerState::Restricted) {
            let last_seen = relevant.iter().map(|event| event.timestamp).max();
            let quiet = last_seen.map_or(true, |last| now - last >= self.cool_down);
            if quiet {
                debug!(caller = %caller, state = %standing.state, "Cool-down elapsed, caller reset to clean");
                *standing = Standing {
                    state: CallerState::Clean,
                    blocked_until: None,
                    reset_at: Some(now),
                    last_decision: standing.last_decision,
                };
                return (CallerState::Clean, Vec::new(), None);
            }
        }

        if standing.state == CallerState::Blocked {
            return (CallerState::Blocked, Vec::new(), standing.blocked_until);
        }

        let mut matched = Vec::new();
        let mut critical = false;
        let mut target = CallerState::Clean;
        for rule in &self.rules {
            if let Some(wanted) = rule.evaluate(&relevant, now) {
                critical |= matches!(rule, RuleConfig::CriticalAnomaly { .. });
                target = target.max(wanted);
                matched.push(rule.id().to_string());
            }
        }

        let state = if critical {
            CallerState::Blocked
        } else if target > standing.state {
            standing.state.escalate()
        } else {
            standing.state
        };

        // A throttle lasts at least until the cool-down could release the caller.
        let expires_at = match state {
            CallerState::Blocked => Some(now + self.block_duration),
            CallerState::Restricted => Some(now + self.throttle_duration.max(self.cool_down)),
            _ => None,
        };

        standing.state = state;
        if state == CallerState::Blocked {
            standing.blocked_until = expires_at;
        }

        (state, matched, expires_at)
    }

    /// Forget standings that can no longer influence a decision. Returns how
    /// many were removed.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.standings.len();
        self.standings
            .retain(|_, standing| !standing.is_settled(now, self.retention));
        let removed = before.saturating_sub(self.standings.len());
        if removed > 0 {
            debug!(removed, "Evicted settled caller standings");
        }
        removed
    }

    /// Run [`FraudEngine::evict_idle`] every `interval` until the task is aborted.
    pub fn spawn_reaper(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately.
            timer.tick().await;

            loop {
                timer.tick().await;
                self.evict_idle(self.clock.now());
            }
        })
    }

    /// How long an idle standing or anomaly history can still matter.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Current state of `caller`, accounting for an expired block.
    pub fn standing(&self, caller: &CallerId) -> CallerState {
        let now = self.clock.now();
        match self.standings.get(caller) {
            Some(standing) => match standing.blocked_until {
                Some(until) if until <= now => CallerState::Clean,
                _ => standing.state,
            },
            None => CallerState::Clean,
        }
    }

    /// Number of callers with a recorded standing.
    pub fn tracked(&self) -> usize {
        self.standings.len()
    }

    fn decision(
        &self,
        caller: &CallerId,
        previous_state: CallerState,
        state: CallerState,
        matched_rules: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FraudDecision {
        let action = FraudAction::for_state(state, !matched_rules.is_empty());
        let reason = match (state == previous_state, matched_rules.is_empty()) {
            (true, true) => format!("remains {}", state),
            (true, false) => format!("remains {} ({})", state, matched_rules.join(", ")),
            (false, true) => format!("{} -> {}", previous_state, state),
            (false, false) => format!(
                "{} -> {} ({})",
                previous_state,
                state,
                matched_rules.join(", ")
            ),
        };

        FraudDecision {
            caller_id: caller.clone(),
            previous_state,
            state,
            action,
            matched_rules,
            reason,
            decided_at: now,
            expires_at,
        }
    }
}

impl fmt::Debug for FraudEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FraudEngine")
            .field("rules", &self.rules.len())
            .field("tracked", &self.standings.len())
            .finish_non_exhaustive()
    }
}
