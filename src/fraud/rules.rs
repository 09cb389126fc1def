//! Configured fraud heuristics.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::CallerState;
use crate::config::ValidationError;
use crate::detect::{AnomalyEvent, AnomalyKind, Severity};

/// Longest lookback or penalty honored, about ten years.
const MAX_SPAN_SECS: i64 = 10 * 365 * 24 * 60 * 60;

pub(super) fn clamped_seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(MAX_SPAN_SECS).min(MAX_SPAN_SECS))
}

/// One heuristic, tagged by `kind` in configuration.
///
/// Windowed rules count anomalies whose timestamp is no older than
/// `window_secs` before the decision time. A rule that escalates to `clean`
/// only gets logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum RuleConfig {
    /// Any critical anomaly blocks the caller outright.
    CriticalAnomaly { id: String },

    /// Sum of severity weights inside the window reaches `min_score`.
    SeverityScore {
        id: String,
        window_secs: u64,
        min_score: u64,
        escalate_to: CallerState,
    },

    /// Rate spike or velocity anomalies inside the window.
    Velocity {
        id: String,
        window_secs: u64,
        min_events: usize,
        escalate_to: CallerState,
    },

    /// Anomalies of any kind packed into a short window.
    Burst {
        id: String,
        window_secs: u64,
        min_events: usize,
        escalate_to: CallerState,
    },

    /// Error spike anomalies inside the window.
    RepeatedFailures {
        id: String,
        window_secs: u64,
        min_events: usize,
        escalate_to: CallerState,
    },
}

impl RuleConfig {
    /// The rule set used when configuration supplies none.
    pub fn defaults() -> Vec<Self> {
        vec![
            RuleConfig::CriticalAnomaly {
                id: "critical-anomaly".to_string(),
            },
            RuleConfig::SeverityScore {
                id: "elevated-severity".to_string(),
                window_secs: 3_600,
                min_score: 4,
                escalate_to: CallerState::Suspicious,
            },
            RuleConfig::SeverityScore {
                id: "sustained-severity".to_string(),
                window_secs: 3_600,
                min_score: 8,
                escalate_to: CallerState::Restricted,
            },
            RuleConfig::SeverityScore {
                id: "persistent-abuse".to_string(),
                window_secs: 3_600,
                min_score: 16,
                escalate_to: CallerState::Blocked,
            },
            RuleConfig::Velocity {
                id: "velocity-abuse".to_string(),
                window_secs: 600,
                min_events: 3,
                escalate_to: CallerState::Restricted,
            },
            RuleConfig::Burst {
                id: "anomaly-burst".to_string(),
                window_secs: 10,
                min_events: 5,
                escalate_to: CallerState::Restricted,
            },
            RuleConfig::RepeatedFailures {
                id: "repeated-failures".to_string(),
                window_secs: 900,
                min_events: 3,
                escalate_to: CallerState::Restricted,
            },
        ]
    }

    pub fn id(&self) -> &str {
        match self {
            RuleConfig::CriticalAnomaly { id }
            | RuleConfig::SeverityScore { id, .. }
            | RuleConfig::Velocity { id, .. }
            | RuleConfig::Burst { id, .. }
            | RuleConfig::RepeatedFailures { id, .. } => id,
        }
    }

    /// Lookback of a windowed rule.
    pub fn window(&self) -> Option<Duration> {
        match self {
            RuleConfig::CriticalAnomaly { .. } => None,
            RuleConfig::SeverityScore { window_secs, .. }
            | RuleConfig::Velocity { window_secs, .. }
            | RuleConfig::Burst { window_secs, .. }
            | RuleConfig::RepeatedFailures { window_secs, .. } => {
                Some(clamped_seconds(*window_secs))
            }
        }
    }

    /// State the rule asks for if it matches `history` at `now`.
    pub fn evaluate(&self, history: &[AnomalyEvent], now: DateTime<Utc>) -> Option<CallerState> {
        let in_window = |event: &&AnomalyEvent| match self.window() {
            Some(window) => event.timestamp >= now - window,
            None => true,
        };

        match self {
            RuleConfig::CriticalAnomaly { .. } => history
                .iter()
                .any(|event| event.severity == Severity::Critical)
                .then_some(CallerState::Blocked),
            RuleConfig::SeverityScore {
                min_score,
                escalate_to,
                ..
            } => {
                let score: u64 = history
                    .iter()
                    .filter(in_window)
                    .map(|event| event.severity.weight())
                    .sum();
                (score >= *min_score).then_some(*escalate_to)
            }
            RuleConfig::Velocity {
                min_events,
                escalate_to,
                ..
            } => {
                let count = history
                    .iter()
                    .filter(in_window)
                    .filter(|event| event.kind.is_velocity())
                    .count();
                (count >= *min_events).then_some(*escalate_to)
            }
            RuleConfig::Burst {
                min_events,
                escalate_to,
                ..
            } => {
                let count = history.iter().filter(in_window).count();
                (count >= *min_events).then_some(*escalate_to)
            }
            RuleConfig::RepeatedFailures {
                min_events,
                escalate_to,
                ..
            } => {
                let count = history
                    .iter()
                    .filter(in_window)
                    .filter(|event| event.kind == AnomalyKind::ErrorSpike)
                    .count();
                (count >= *min_events).then_some(*escalate_to)
            }
        }
    }

    fn check(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| -> Result<(), ValidationError> {
            Err(ValidationError::fraud(format!("rule '{}' {}", self.id(), reason)))
        };

        match self {
            RuleConfig::CriticalAnomaly { .. } => Ok(()),
            RuleConfig::SeverityScore {
                window_secs,
                min_score,
                ..
            } => {
                if *window_secs == 0 {
                    invalid("has a zero window")
                } else if *min_score == 0 {
                    invalid("has a zero min_score")
                } else {
                    Ok(())
                }
            }
            RuleConfig::Velocity {
                window_secs,
                min_events,
                ..
            }
            | RuleConfig::Burst {
                window_secs,
                min_events,
                ..
            }
            | RuleConfig::RepeatedFailures {
                window_secs,
                min_events,
                ..
            } => {
                if *window_secs == 0 {
                    invalid("has a zero window")
                } else if *min_events == 0 {
                    invalid("has a zero min_events")
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Check every rule and that ids are non-empty and unique.
pub fn validate_rules(rules: &[RuleConfig]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.id().trim().is_empty() {
            return Err(ValidationError::fraud("rule ids must not be empty"));
        }
        if !seen.insert(rule.id()) {
            return Err(ValidationError::fraud(format!(
                "duplicate rule id '{}'",
                rule.id()
            )));
        }
        rule.check()?;
    }
    Ok(())
}
