//! Multi-tier rate limiting over a shared counter store.

mod limiter;
mod rules;
mod window;

pub use limiter::{LimiterSettings, RateLimitResult, RateLimiter, Verdict};
pub use rules::{ClassRules, TierLimits, DEFAULT_CLASS};
pub use window::{Tier, WindowKey};
