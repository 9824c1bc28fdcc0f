//! Connection status types carried on the event channel.
//!
//! Entity-change payloads stay untyped (`serde_json::Value`) at this layer;
//! consumers validate them against their own schemas. The connection-status
//! stream is shared by every consumer, so its shape is fixed here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event type reserved for connection-state transitions.
pub const CONNECTION_STATUS_EVENT: &str = "connection-status";

/// State of the underlying push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The connection is established and events are flowing.
    Connected,
    /// The connection dropped; events may be lost.
    Disconnected,
    /// The transport is trying to re-establish the connection.
    Reconnecting,
}

impl ConnectionStatus {
    /// Whether events are currently being delivered.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Wire name of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a [`CONNECTION_STATUS_EVENT`] notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusPayload {
    /// New connection state.
    pub status: ConnectionStatus,
    /// Number of reconnect attempts made so far in the current outage.
    #[serde(default)]
    pub reconnect_attempts: u32,
}

impl ConnectionStatusPayload {
    /// Create a payload for the given status.
    #[must_use]
    pub const fn new(status: ConnectionStatus, reconnect_attempts: u32) -> Self {
        Self {
            status,
            reconnect_attempts,
        }
    }

    /// A `connected` payload.
    #[must_use]
    pub const fn connected() -> Self {
        Self::new(ConnectionStatus::Connected, 0)
    }

    /// A `disconnected` payload.
    #[must_use]
    pub const fn disconnected() -> Self {
        Self::new(ConnectionStatus::Disconnected, 0)
    }

    /// A `reconnecting` payload after `attempts` tries.
    #[must_use]
    pub const fn reconnecting(attempts: u32) -> Self {
        Self::new(ConnectionStatus::Reconnecting, attempts)
    }

    /// Decode a raw channel payload.
    ///
    /// Returns `None` when the payload does not describe a known status.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    /// Encode as a raw channel payload.
    #[must_use]
    pub fn to_value(self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status.as_str(),
            "reconnectAttempts": self.reconnect_attempts,
        })
    }
}
