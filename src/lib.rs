//! Tollgate - Distributed Rate Limiting and Abuse Detection
//!
//! This crate enforces per-caller request quotas over minute, hour and day
//! windows against a shared counter store, and runs every request outcome
//! through an asynchronous pipeline that profiles caller behavior, flags
//! statistical anomalies, and escalates abusive callers to throttles and
//! blocks.

pub mod caller;
pub mod clock;
pub mod config;
pub mod detect;
pub mod error;
pub mod fraud;
pub mod metrics;
pub mod pipeline;
pub mod profile;
pub mod ratelimit;
pub mod sink;
pub mod store;

pub use caller::{CallerId, RequestEvent};
pub use config::TollgateConfig;
pub use error::{Result, TollgateError};
pub use pipeline::SecurityPipeline;
pub use ratelimit::{RateLimitResult, RateLimiter, Verdict};
