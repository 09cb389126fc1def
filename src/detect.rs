//! Statistical anomaly detection over behavior profiles.
//!
//! Each event is scored against its caller's profile as it stands after the
//! event was folded in. Scores are z-scores per signal; the strongest positive
//! deviation decides the anomaly kind and severity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::caller::{CallerId, RequestEvent};
use crate::config::{AnomalyConfig, Validate, ValidationError};
use crate::profile::{BehaviorProfile, SignalStats};

/// What kind of deviation was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Request velocity well above the caller's norm.
    RateSpike,
    /// Request velocity at or beyond the critical threshold.
    Velocity,
    /// Failure rate well above the caller's norm.
    ErrorSpike,
    /// Payload size well above the caller's norm.
    PayloadAnomaly,
}

impl AnomalyKind {
    /// Whether this kind describes request velocity.
    pub fn is_velocity(&self) -> bool {
        matches!(self, AnomalyKind::RateSpike | AnomalyKind::Velocity)
    }
}

/// Ordered anomaly severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Weight of one anomaly of this severity in a severity score.
    pub fn weight(&self) -> u64 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 4,
            Severity::Critical => 8,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Lower z-score bound of each severity. Must be strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: 2.0,
            medium: 3.0,
            high: 4.0,
            critical: 6.0,
        }
    }
}

impl SeverityThresholds {
    /// Severity for a z-score, or `None` below `low`.
    ///
    /// Monotonic: a larger z never yields a lower severity.
    pub fn classify(&self, z: f64) -> Option<Severity> {
        if z >= self.critical {
            Some(Severity::Critical)
        } else if z >= self.high {
            Some(Severity::High)
        } else if z >= self.medium {
            Some(Severity::Medium)
        } else if z >= self.low {
            Some(Severity::Low)
        } else {
            None
        }
    }
}

impl Validate for SeverityThresholds {
    fn validate(&self) -> Result<(), ValidationError> {
        let bounds = [self.low, self.medium, self.high, self.critical];
        if bounds.iter().any(|b| !b.is_finite()) || self.low <= 0.0 {
            return Err(ValidationError::anomaly(
                "severity thresholds must be positive numbers",
            ));
        }
        if !bounds.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(ValidationError::anomaly(format!(
                "severity thresholds must be strictly increasing, got {:?}",
                bounds
            )));
        }
        Ok(())
    }
}

/// A profiled signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    RequestRate,
    ErrorRate,
    PayloadSize,
}

/// How one signal of an event compared with the caller's baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalScore {
    pub signal: Signal,
    pub observed: f64,
    pub mean: f64,
    pub stddev: f64,
    pub z: f64,
}

/// A detected deviation from a caller's baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub caller_id: CallerId,
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// Z-score of the signal that triggered the anomaly.
    pub score: f64,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    /// Every signal's score for the triggering event.
    pub signals: Vec<SignalScore>,
}

/// Scores events against profiles.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    warmup_samples: u64,
    stddev_floor_ratio: f64,
    thresholds: SeverityThresholds,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(&AnomalyConfig::default())
    }
}

impl AnomalyDetector {
    pub fn new(config: &AnomalyConfig) -> Self {
        Self {
            warmup_samples: config.warmup_samples,
            stddev_floor_ratio: config.stddev_floor_ratio,
            thresholds: config.thresholds,
        }
    }

    pub fn thresholds(&self) -> &SeverityThresholds {
        &self.thresholds
    }

    /// Score `event` against `profile`, the snapshot returned when the event
    /// was folded in.
    ///
    /// Profiles still warming up never produce anomalies. Only deviations
    /// above the baseline count.
    pub fn evaluate(&self, profile: &BehaviorProfile, event: &RequestEvent) -> Option<AnomalyEvent> {
        if profile.sample_count < self.warmup_samples {
            return None;
        }

        let error = if event.is_error() { 1.0 } else { 0.0 };
        let signals = vec![
            self.score(Signal::RequestRate, &profile.request_rate, profile.velocity),
            self.score(Signal::ErrorRate, &profile.error_rate, error),
            self.score(Signal::PayloadSize, &profile.payload_size, event.payload_size as f64),
        ];

        let strongest = signals
            .iter()
            .copied()
            .filter(|s| s.z > 0.0)
            .max_by(|a, b| a.z.total_cmp(&b.z))?;
        let severity = self.thresholds.classify(strongest.z)?;

        let kind = match strongest.signal {
            Signal::RequestRate if strongest.z >= self.thresholds.critical => AnomalyKind::Velocity,
            Signal::RequestRate => AnomalyKind::RateSpike,
            Signal::ErrorRate => AnomalyKind::ErrorSpike,
            Signal::PayloadSize => AnomalyKind::PayloadAnomaly,
        };

        trace!(
            caller = %event.caller_id,
            kind = ?kind,
            severity = %severity,
            z = strongest.z,
            "Event deviates from baseline"
        );

        Some(AnomalyEvent {
            id: Uuid::new_v4(),
            caller_id: event.caller_id.clone(),
            kind,
            severity,
            score: strongest.z,
            endpoint: event.endpoint.clone(),
            timestamp: event.timestamp,
            signals,
        })
    }

    fn score(&self, signal: Signal, stats: &SignalStats, observed: f64) -> SignalScore {
        SignalScore {
            signal,
            observed,
            mean: stats.mean,
            stddev: stats.stddev(),
            z: stats.z_score(observed, self.stddev_floor_ratio),
        }
    }
}
