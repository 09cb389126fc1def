//! Caller identity and the request events recorded against it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identity that quotas and behavior tracking are keyed on.
///
/// Typically an API key hash or an IP + fingerprint composite. Cloning is
/// cheap, the id is shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallerId(Arc<str>);

impl CallerId {
    /// Create a caller id. Returns `None` for an empty or blank id; any other
    /// id is kept byte for byte.
    pub fn new(id: impl AsRef<str>) -> Option<Self> {
        let id = id.as_ref();
        if id.trim().is_empty() {
            return None;
        }
        Some(Self(Arc::from(id)))
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CallerId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CallerId::new(&value).ok_or_else(|| "caller id must not be empty".to_string())
    }
}

impl From<CallerId> for String {
    fn from(id: CallerId) -> Self {
        id.0.to_string()
    }
}

/// One completed API call, as seen by the profiling pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub caller_id: CallerId,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub response_time_ms: u64,
    pub status_code: u16,
    #[serde(default)]
    pub payload_size: u64,
}

impl RequestEvent {
    /// Whether the call failed from the caller's side or ours.
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_id_rejects_blank() {
        assert!(CallerId::new("").is_none());
        assert!(CallerId::new("   ").is_none());
    }

    #[test]
    fn test_caller_id_is_kept_verbatim() {
        let padded = CallerId::new("k ").unwrap();
        let bare = CallerId::new("k").unwrap();
        assert_eq!(padded.as_str(), "k ");
        assert_ne!(padded, bare);
    }

    #[test]
    fn test_caller_id_equality_and_display() {
        let a = CallerId::new("203.0.113.9#fp").unwrap();
        let b = CallerId::new("203.0.113.9#fp").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "203.0.113.9#fp");
    }

    #[test]
    fn test_request_event_from_json() {
        let json = r#"{
            "caller_id": "api-key-7",
            "endpoint": "/quiz/generate",
            "timestamp": "2024-01-01T00:00:00Z",
            "response_time_ms": 180,
            "status_code": 422,
            "payload_size": 2048
        }"#;
        let event: RequestEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.caller_id.as_str(), "api-key-7");
        assert!(event.is_error());
        assert_eq!(event.payload_size, 2048);
    }

    #[test]
    fn test_request_event_rejects_empty_caller() {
        let json = r#"{"caller_id": "", "endpoint": "/", "timestamp": "2024-01-01T00:00:00Z", "status_code": 200}"#;
        assert!(serde_json::from_str::<RequestEvent>(json).is_err());
    }
}
