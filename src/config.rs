//! Configuration management for Tollgate.
//!
//! Configuration is loaded once at startup from an optional YAML file plus
//! `TOLLGATE__*` environment overrides, then validated. Nothing reads it again
//! after the components are built.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::detect::SeverityThresholds;
use crate::error::Result;
use crate::fraud::RuleConfig;
use crate::ratelimit::ClassRules;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Behavior profile configuration
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Anomaly detection configuration
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Fraud rule configuration
    #[serde(default)]
    pub fraud: FraudConfig,

    /// Event pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store. Only correct for a single instance.
    #[default]
    Memory,
    /// Shared Redis store.
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, used when `backend` is `redis`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every key written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Delay before retrying a failed store call in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

fn default_timeout_ms() -> u64 {
    25
}

fn default_retry_backoff_ms() -> u64 {
    5
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitingConfig {
    /// When false, every check is allowed without counting
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds a counter outlives its window
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Divisor applied to every limit while a caller is throttled
    #[serde(default = "default_throttle_divisor")]
    pub throttle_divisor: u64,

    /// Tier limits per endpoint class
    #[serde(default)]
    pub classes: ClassRules,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            grace_secs: default_grace_secs(),
            throttle_divisor: default_throttle_divisor(),
            classes: ClassRules::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_grace_secs() -> u64 {
    5
}

fn default_throttle_divisor() -> u64 {
    4
}

/// Behavior profile configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    /// Smoothing factor of the moving statistics, in (0, 1]
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Time constant of the request velocity signal in seconds
    #[serde(default = "default_velocity_horizon_secs")]
    pub velocity_horizon_secs: u64,

    /// Profiles unseen for this long are evicted
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,

    /// How often the eviction sweep runs
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            velocity_horizon_secs: default_velocity_horizon_secs(),
            idle_eviction_secs: default_idle_eviction_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

fn default_alpha() -> f64 {
    0.02
}

fn default_velocity_horizon_secs() -> u64 {
    60
}

fn default_idle_eviction_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_reaper_interval_secs() -> u64 {
    60 * 60
}

/// Anomaly detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnomalyConfig {
    /// Samples a profile needs before it can raise anomalies
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: u64,

    /// Lower bound on the deviation used for z-scores, as a fraction of the mean
    #[serde(default = "default_stddev_floor_ratio")]
    pub stddev_floor_ratio: f64,

    /// Z-score boundaries between severities
    #[serde(default)]
    pub thresholds: SeverityThresholds,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            warmup_samples: default_warmup_samples(),
            stddev_floor_ratio: default_stddev_floor_ratio(),
            thresholds: SeverityThresholds::default(),
        }
    }
}

fn default_warmup_samples() -> u64 {
    30
}

fn default_stddev_floor_ratio() -> f64 {
    0.1
}

/// Fraud rule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FraudConfig {
    /// How long a block lasts
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,

    /// How long a throttle lasts
    #[serde(default = "default_throttle_duration_secs")]
    pub throttle_duration_secs: u64,

    /// Quiet time after which a suspicious or restricted caller is clean again
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,

    /// Anomalies retained per caller for rule evaluation
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Ordered rule set
    #[serde(default = "RuleConfig::defaults")]
    pub rules: Vec<RuleConfig>,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            block_duration_secs: default_block_duration_secs(),
            throttle_duration_secs: default_throttle_duration_secs(),
            cool_down_secs: default_cool_down_secs(),
            max_history: default_max_history(),
            rules: RuleConfig::defaults(),
        }
    }
}

fn default_block_duration_secs() -> u64 {
    60 * 60
}

fn default_throttle_duration_secs() -> u64 {
    15 * 60
}

fn default_cool_down_secs() -> u64 {
    30 * 60
}

fn default_max_history() -> usize {
    256
}

/// Event pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Number of profiling workers, each with its own queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of each worker queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

impl TollgateConfig {
    /// Load configuration from an optional file plus `TOLLGATE__*` environment
    /// variables, which take priority. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Parse and validate configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml).map_err(|e| {
            crate::error::TollgateError::ConfigInvalid(format!("Failed to parse configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration sections that can check their own values.
pub trait Validate {
    fn validate(&self) -> std::result::Result<(), ValidationError>;
}

/// A configuration value outside its allowed range, by section.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("store: {0}")]
    Store(String),

    #[error("rate_limiting: {0}")]
    RateLimiting(String),

    #[error("profile: {0}")]
    Profile(String),

    #[error("anomaly: {0}")]
    Anomaly(String),

    #[error("fraud: {0}")]
    Fraud(String),

    #[error("pipeline: {0}")]
    Pipeline(String),
}

impl ValidationError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn rate_limiting(msg: impl Into<String>) -> Self {
        Self::RateLimiting(msg.into())
    }

    pub fn profile(msg: impl Into<String>) -> Self {
        Self::Profile(msg.into())
    }

    pub fn anomaly(msg: impl Into<String>) -> Self {
        Self::Anomaly(msg.into())
    }

    pub fn fraud(msg: impl Into<String>) -> Self {
        Self::Fraud(msg.into())
    }

    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }
}

impl Validate for TollgateConfig {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        self.store.validate()?;
        self.rate_limiting.validate()?;
        self.profile.validate()?;
        self.anomaly.validate()?;
        self.fraud.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }
}

impl Validate for StoreConfig {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::store("timeout_ms must be positive"));
        }
        if self.backend == StoreBackend::Redis && self.redis_url.trim().is_empty() {
            return Err(ValidationError::store("redis_url is required for the redis backend"));
        }
        Ok(())
    }
}

impl Validate for RateLimitingConfig {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.throttle_divisor == 0 {
            return Err(ValidationError::rate_limiting("throttle_divisor must be at least 1"));
        }
        self.classes.validate()
    }
}

impl Validate for ProfileConfig {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(ValidationError::profile(format!(
                "alpha must be in (0, 1], got {}",
                self.alpha
            )));
        }
        if self.velocity_horizon_secs == 0 {
            return Err(ValidationError::profile("velocity_horizon_secs must be positive"));
        }
        if self.idle_eviction_secs == 0 || self.reaper_interval_secs == 0 {
            return Err(ValidationError::profile(
                "idle_eviction_secs and reaper_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

impl Validate for AnomalyConfig {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if !self.stddev_floor_ratio.is_finite() || self.stddev_floor_ratio < 0.0 {
            return Err(ValidationError::anomaly(format!(
                "stddev_floor_ratio must be a non-negative number, got {}",
                self.stddev_floor_ratio
            )));
        }
        self.thresholds.validate()
    }
}

impl Validate for FraudConfig {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.block_duration_secs == 0
            || self.throttle_duration_secs == 0
            || self.cool_down_secs == 0
        {
            return Err(ValidationError::fraud("durations must be positive"));
        }
        if self.max_history == 0 {
            return Err(ValidationError::fraud("max_history must be positive"));
        }
        crate::fraud::validate_rules(&self.rules)
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::pipeline("workers must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(ValidationError::pipeline("queue_capacity must be positive"));
        }
        Ok(())
    }
}
