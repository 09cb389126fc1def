//! Per-endpoint-class quota rules.
//!
//! Each endpoint class carries its own set of tier limits. Lookups for a class
//! with no rules fall back to the `default` class.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::window::Tier;
use crate::config::{Validate, ValidationError};
use crate::error::{Result, TollgateError};

/// Name of the class used when a request's class has no rules of its own.
pub const DEFAULT_CLASS: &str = "default";

/// Tier limits for one endpoint class. A missing tier is not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u64>,
}

impl TierLimits {
    /// Build limits from `(minute, hour, day)` values.
    pub fn new(minute: Option<u64>, hour: Option<u64>, day: Option<u64>) -> Self {
        Self { minute, hour, day }
    }

    /// Limit for a single tier.
    pub fn get(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Minute => self.minute,
            Tier::Hour => self.hour,
            Tier::Day => self.day,
        }
    }

    /// Configured `(tier, limit)` pairs, shortest tier first.
    pub fn enforced(&self) -> Vec<(Tier, u64)> {
        Tier::ALL
            .iter()
            .filter_map(|tier| self.get(*tier).map(|limit| (*tier, limit)))
            .collect()
    }

    /// Whether no tier is enforced.
    pub fn is_empty(&self) -> bool {
        self.minute.is_none() && self.hour.is_none() && self.day.is_none()
    }
}

/// The complete set of class rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassRules {
    classes: BTreeMap<String, TierLimits>,
}

impl Default for ClassRules {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(
            DEFAULT_CLASS.to_string(),
            TierLimits::new(Some(60), Some(1_000), Some(10_000)),
        );
        Self { classes }
    }
}

impl ClassRules {
    /// Create rules from an explicit class map.
    pub fn new(classes: BTreeMap<String, TierLimits>) -> Self {
        Self { classes }
    }

    /// Load class rules from a YAML mapping of class name to tier limits.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: ClassRules = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::ConfigInvalid(format!("Failed to parse class rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Add or replace the limits for a class.
    pub fn with_class(mut self, class: impl Into<String>, limits: TierLimits) -> Self {
        self.classes.insert(class.into(), limits);
        self
    }

    /// Resolve the class whose rules apply to `class`, with its limits.
    ///
    /// Returns the class name actually used so counters are scoped to it.
    pub fn resolve<'a>(&'a self, class: &'a str) -> Option<(&'a str, &'a TierLimits)> {
        if let Some(limits) = self.classes.get(class) {
            return Some((class, limits));
        }
        self.classes
            .get(DEFAULT_CLASS)
            .map(|limits| (DEFAULT_CLASS, limits))
    }

    /// Iterate over all classes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TierLimits)> {
        self.classes.iter()
    }
}

impl Validate for ClassRules {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if !self.classes.contains_key(DEFAULT_CLASS) {
            return Err(ValidationError::rate_limiting(format!(
                "a '{}' endpoint class is required",
                DEFAULT_CLASS
            )));
        }

        for (class, limits) in &self.classes {
            if class.is_empty() || class.contains('|') {
                return Err(ValidationError::rate_limiting(format!(
                    "invalid endpoint class name '{}'",
                    class
                )));
            }
            if limits.is_empty() {
                return Err(ValidationError::rate_limiting(format!(
                    "endpoint class '{}' enforces no tier",
                    class
                )));
            }
            if let Some((tier, _)) = limits.enforced().into_iter().find(|(_, limit)| *limit == 0) {
                return Err(ValidationError::rate_limiting(format!(
                    "endpoint class '{}' has a zero {} limit",
                    class, tier
                )));
            }
        }

        Ok(())
    }
}
