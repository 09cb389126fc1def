//! Per-caller behavioral profiles.
//!
//! A profile is a constant-size summary of a caller's history: an
//! exponentially weighted mean and variance for each tracked signal. No raw
//! history is kept, so memory per caller is fixed regardless of traffic.
//!
//! Each signal is updated with weight `a = max(alpha, 1/n)` where `n` is the
//! sample count including the new observation:
//!
//! ```text
//! diff      = x - mean
//! mean     += a * diff
//! variance  = (1 - a) * (variance + a * diff^2)
//! ```
//!
//! While `n <= 1/alpha` this is exactly Welford's running population
//! estimator, so a young profile converges on its true baseline instead of
//! being dominated by its first samples. Past that point older samples decay
//! geometrically and a single outlier moves the baseline by at most `alpha`.

mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::caller::{CallerId, RequestEvent};
use crate::config::ProfileConfig;

pub use store::ProfileStore;

/// Running mean and variance of one signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub mean: f64,
    pub variance: f64,
}

impl SignalStats {
    /// Fold one observation in with weight `weight`.
    fn observe(&mut self, value: f64, weight: f64) {
        let diff = value - self.mean;
        self.mean += weight * diff;
        self.variance = (1.0 - weight) * (self.variance + weight * diff * diff);
    }

    pub fn stddev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    /// Standard deviations `value` lies above or below the mean.
    ///
    /// The deviation is never smaller than `floor_ratio * |mean|`, so a signal
    /// that happens to have been constant does not turn a tiny wobble into
    /// an extreme score. Returns 0 when no spread can be established.
    pub fn z_score(&self, value: f64, floor_ratio: f64) -> f64 {
        let spread = self.stddev().max(floor_ratio * self.mean.abs());
        if spread <= f64::EPSILON {
            return 0.0;
        }
        (value - self.mean) / spread
    }

    fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.variance.is_finite() && self.variance >= 0.0
    }
}

/// Update parameters shared by every profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileParams {
    /// Smoothing factor once a profile is warm.
    pub alpha: f64,
    /// Time constant of the decayed request count.
    pub velocity_horizon: Duration,
}

impl Default for ProfileParams {
    fn default() -> Self {
        Self {
            alpha: 0.02,
            velocity_horizon: Duration::from_secs(60),
        }
    }
}

impl ProfileParams {
    pub fn from_config(config: &ProfileConfig) -> Self {
        Self {
            alpha: config.alpha,
            velocity_horizon: Duration::from_secs(config.velocity_horizon_secs),
        }
    }
}

/// Constant-size statistical summary of one caller's behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub caller_id: CallerId,
    /// Distribution of the decayed request count seen at each request.
    pub request_rate: SignalStats,
    /// Distribution of the per-request error indicator.
    pub error_rate: SignalStats,
    /// Distribution of payload sizes in bytes.
    pub payload_size: SignalStats,
    /// Decayed request count as of `last_updated`, roughly the number of
    /// requests within one velocity horizon.
    pub velocity: f64,
    pub sample_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl BehaviorProfile {
    /// An empty profile with no samples.
    pub fn cold(caller_id: CallerId, now: DateTime<Utc>) -> Self {
        Self {
            caller_id,
            request_rate: SignalStats::default(),
            error_rate: SignalStats::default(),
            payload_size: SignalStats::default(),
            velocity: 0.0,
            sample_count: 0,
            created_at: now,
            last_updated: now,
        }
    }

    /// Build the profile that results from folding `event` into this one.
    ///
    /// Events older than `last_updated` are applied with zero elapsed time,
    /// which keeps out-of-order delivery from inflating the decay.
    pub fn observe(&self, event: &RequestEvent, params: &ProfileParams) -> Self {
        let mut next = self.clone();
        let count = self.sample_count + 1;
        let weight = params.alpha.max(1.0 / count as f64);

        let velocity = if self.sample_count == 0 {
            1.0
        } else {
            let elapsed = (event.timestamp - self.last_updated)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let horizon = params.velocity_horizon.as_secs_f64().max(f64::EPSILON);
            self.velocity * (-elapsed.as_secs_f64() / horizon).exp() + 1.0
        };

        next.velocity = velocity;
        next.request_rate.observe(velocity, weight);
        next.error_rate
            .observe(if event.is_error() { 1.0 } else { 0.0 }, weight);
        next.payload_size.observe(event.payload_size as f64, weight);
        next.sample_count = count;
        next.last_updated = self.last_updated.max(event.timestamp);
        if self.sample_count == 0 {
            next.created_at = event.timestamp;
        }
        next
    }

    /// Whether every statistic holds a usable number.
    pub fn is_consistent(&self) -> bool {
        self.request_rate.is_finite()
            && self.error_rate.is_finite()
            && self.payload_size.is_finite()
            && self.velocity.is_finite()
            && self.velocity >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(secs: i64, status: u16, payload: u64) -> RequestEvent {
        RequestEvent {
            caller_id: CallerId::new("p").unwrap(),
            endpoint: "/describe".to_string(),
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
            response_time_ms: 200,
            status_code: status,
            payload_size: payload,
        }
    }

    fn warm(samples: &[(i64, u16, u64)]) -> BehaviorProfile {
        let params = ProfileParams::default();
        let start = DateTime::from_timestamp(0, 0).unwrap();
        samples.iter().fold(
            BehaviorProfile::cold(CallerId::new("p").unwrap(), start),
            |profile, (t, status, payload)| profile.observe(&event(*t, *status, *payload), &params),
        )
    }

    #[test]
    fn test_young_profile_matches_population_statistics() {
        let profile = warm(&[(0, 200, 100), (1, 200, 200), (2, 200, 300), (3, 200, 400)]);
        assert_eq!(profile.sample_count, 4);
        assert!((profile.payload_size.mean - 250.0).abs() < 1e-9);
        // Population variance of 100, 200, 300, 400.
        assert!((profile.payload_size.variance - 12_500.0).abs() < 1e-6);
    }

    #[test]
    fn test_error_rate_tracks_failure_fraction() {
        let mut samples: Vec<(i64, u16, u64)> = (0..49).map(|i| (i, 200, 512)).collect();
        samples.push((49, 500, 512));
        let profile = warm(&samples);

        assert!((profile.error_rate.mean - 0.02).abs() < 1e-9);
        assert!((profile.error_rate.variance - 0.0196).abs() < 1e-9);
    }

    #[test]
    fn test_single_outlier_moves_warm_baseline_by_alpha() {
        let samples: Vec<(i64, u16, u64)> = (0..200).map(|i| (i * 2, 200, 1_000)).collect();
        let profile = warm(&samples);
        let params = ProfileParams::default();

        let after = profile.observe(&event(400, 200, 101_000), &params);
        let shift = after.payload_size.mean - profile.payload_size.mean;
        assert!((shift - 0.02 * 100_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_velocity_decays_with_gap() {
        let params = ProfileParams::default();
        let profile = warm(&[(0, 200, 0)]);
        assert_eq!(profile.velocity, 1.0);

        let burst = profile.observe(&event(0, 200, 0), &params);
        assert!((burst.velocity - 2.0).abs() < 1e-9);

        let later = profile.observe(&event(600, 200, 0), &params);
        assert!(later.velocity < 1.001);
    }

    #[test]
    fn test_out_of_order_event_does_not_rewind() {
        let params = ProfileParams::default();
        let profile = warm(&[(100, 200, 0)]);
        let late = profile.observe(&event(50, 200, 0), &params);

        assert_eq!(late.last_updated, profile.last_updated);
        assert!((late.velocity - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_z_score_floor_and_degenerate_spread() {
        let constant = SignalStats {
            mean: 1_000.0,
            variance: 0.0,
        };
        assert!(constant.z_score(1_001.0, 0.1) < 0.1);
        assert!((constant.z_score(2_000.0, 0.1) - 10.0).abs() < 1e-9);

        let empty = SignalStats::default();
        assert_eq!(empty.z_score(5.0, 0.1), 0.0);
    }
}
