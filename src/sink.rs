//! Fire-and-forget publication of security records.
//!
//! The alerting and analytics layers consume these records; the core never
//! waits for them to be handled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::caller::CallerId;
use crate::detect::AnomalyEvent;
use crate::fraud::{FraudAction, FraudDecision};

/// What went wrong when the core had to degrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The counter store failed twice and a check was allowed without counting.
    StoreFailOpen,
    /// The profiling queue was full and an event was discarded.
    EventDropped,
    /// A stored profile could not be decoded and was replaced by a cold one.
    ProfileCorrupt,
    /// A block or throttle could not be written to the block list.
    EnforcementFailed,
}

/// A degraded-mode signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub caller_id: Option<CallerId>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(
        kind: DiagnosticKind,
        caller_id: Option<&CallerId>,
        detail: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            caller_id: caller_id.cloned(),
            detail: detail.into(),
            timestamp,
        }
    }
}

/// Anything the core emits for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SecurityRecord {
    Anomaly(AnomalyEvent),
    Decision(FraudDecision),
    Diagnostic(Diagnostic),
}

/// Destination for security records.
pub trait EventSink: Send + Sync {
    /// Hand a record off. Must not block.
    fn publish(&self, record: SecurityRecord);
}

/// Sink that writes records as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, record: SecurityRecord) {
        match record {
            SecurityRecord::Anomaly(event) => warn!(
                caller = %event.caller_id,
                kind = ?event.kind,
                severity = ?event.severity,
                score = event.score,
                "Anomaly detected"
            ),
            SecurityRecord::Decision(decision) if decision.action == FraudAction::None => debug!(
                caller = %decision.caller_id,
                state = ?decision.state,
                "Fraud decision: no action"
            ),
            SecurityRecord::Decision(decision) => info!(
                caller = %decision.caller_id,
                action = ?decision.action,
                state = ?decision.state,
                rules = ?decision.matched_rules,
                expires_at = ?decision.expires_at,
                "Fraud decision"
            ),
            SecurityRecord::Diagnostic(diagnostic) => warn!(
                kind = ?diagnostic.kind,
                caller = ?diagnostic.caller_id.as_ref().map(|c| c.as_str()),
                detail = %diagnostic.detail,
                "Degraded operation"
            ),
        }
    }
}

/// Sink that forwards records into a bounded channel, dropping on overflow.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<SecurityRecord>,
}

impl ChannelSink {
    /// Create the sink together with the receiving end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SecurityRecord>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, record: SecurityRecord) {
        if self.sender.try_send(record).is_err() {
            debug!("Security record channel full or closed, record dropped");
        }
    }
}

/// Sink that keeps every record in memory. Useful for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    records: Arc<Mutex<Vec<SecurityRecord>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything published so far.
    pub fn records(&self) -> Vec<SecurityRecord> {
        self.records.lock().clone()
    }

    /// Published anomaly events.
    pub fn anomalies(&self) -> Vec<AnomalyEvent> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                SecurityRecord::Anomaly(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Published fraud decisions.
    pub fn decisions(&self) -> Vec<FraudDecision> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                SecurityRecord::Decision(decision) => Some(decision.clone()),
                _ => None,
            })
            .collect()
    }

    /// Published diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                SecurityRecord::Diagnostic(diagnostic) => Some(diagnostic.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, record: SecurityRecord) {
        self.records.lock().push(record);
    }
}
