use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Readiness of the single device-control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Counters kept by the transport for status displays.
///
/// Callers only ever receive copies; the transport task is the sole writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Number of handshakes that reached the open state.
    pub connection_attempts: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// Frames currently waiting in the outbound queue.
    pub queued_messages: usize,
    /// Frames evicted because the outbound queue hit its configured bound.
    pub dropped_messages: u64,
}

/// The `{topic, data}` unit exchanged over the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }
}

/// Error type shared by the transport and the message bus.
///
/// Payloads are plain strings so errors can be cloned into every listener
/// that observes them.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Connection timed out after {0} ms")]
    Timeout(u64),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Middleware Error: {0}")]
    Middleware(String),

    #[error("Handler Error on {topic}: {details}")]
    Handler { topic: String, details: String },

    #[error("Configuration Error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_state_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Open).unwrap();
        assert_eq!(json, "\"open\"");
        let back: ConnectionState = serde_json::from_str("\"closing\"").unwrap();
        assert_eq!(back, ConnectionState::Closing);
    }

    #[test]
    fn connection_state_display_matches_wire_name() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = Envelope::new("mount/slew", json!({ "ra": 10.5, "dec": -3.2 }));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["topic"], "mount/slew");
        assert_eq!(value["data"]["ra"], 10.5);
    }

    #[test]
    fn default_stats_are_zeroed() {
        let stats = ConnectionStats::default();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.connection_attempts, 0);
        assert!(stats.last_connected_at.is_none());
        assert!(stats.last_disconnected_at.is_none());
    }

    #[test]
    fn link_error_display() {
        let err = LinkError::Handler {
            topic: "guider/status".to_string(),
            details: "boom".to_string(),
        };
        assert!(err.to_string().contains("guider/status"));
        assert!(LinkError::Timeout(250).to_string().contains("250"));
    }
}
