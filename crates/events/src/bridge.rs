//! Bridge from a newline-delimited JSON stream onto an [`EventBus`].
//!
//! Each line is one [`WireMessage`]:
//!
//! ```text
//! {"event": "pipelines-updated", "payload": {"providerId": 1, "pipelines": []}}
//! {"status": "disconnected", "reconnectAttempts": 0}
//! ```
//!
//! Undecodable lines are logged and skipped; they never stop the bridge.
//! A status frame with an unrecognized `status` is still forwarded so that
//! subscribers can treat it as a lost connection.

use crate::bus::EventBus;
use crate::event::{CONNECTION_STATUS_EVENT, ConnectionStatusPayload};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

/// One framed message from the push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    /// An entity-change notification.
    Event {
        /// Event type name.
        event: String,
        /// Event-specific payload.
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// A connection-state transition.
    Status(ConnectionStatusPayload),
    /// A status frame whose fields did not decode.
    UnknownStatus {
        /// The unrecognized status value.
        status: Value,
        /// Remaining fields, forwarded untouched.
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
}

impl WireMessage {
    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the line is neither an event nor a status.
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::decode(e.to_string()))
    }

    /// Publish this message on `bus`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the bus has been shut down.
    pub fn publish_to(self, bus: &EventBus) -> Result<usize> {
        match self {
            Self::Event { event, payload } => bus.publish(&event, payload),
            Self::Status(status) => bus.publish_status(status),
            Self::UnknownStatus { status, mut rest } => {
                tracing::warn!(%status, "Unrecognized connection status");
                rest.insert("status".to_string(), status);
                bus.publish(CONNECTION_STATUS_EVENT, Value::Object(rest))
            }
        }
    }
}

/// Counters reported when a bridge finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Messages published on the bus.
    pub published: usize,
    /// Lines that could not be decoded.
    pub malformed: usize,
}

/// Pump `reader` into `bus` until end of stream or cancellation.
///
/// Blank lines are ignored. Lines that are not valid UTF-8 count as malformed.
///
/// # Errors
///
/// Returns an error if reading fails or the bus is closed underneath the bridge.
pub async fn run_bridge<R>(
    mut reader: R,
    bus: EventBus,
    cancel: CancellationToken,
) -> Result<BridgeStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut stats = BridgeStats::default();

    loop {
        buf.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Bridge cancelled");
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => read?,
        };

        if read == 0 {
            tracing::debug!("Event stream ended");
            break;
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(error = %e, "Skipping wire message that is not UTF-8");
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match WireMessage::parse(trimmed) {
            Ok(message) => {
                message.publish_to(&bus)?;
                stats.published += 1;
            }
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(error = %e, "Skipping malformed wire message");
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::handler;
    use crate::event::{CONNECTION_STATUS_EVENT, ConnectionStatus};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_event_line() {
        let msg = WireMessage::parse(r#"{"event":"provider-added","payload":{"providerId":4}}"#)
            .unwrap();
        assert_eq!(
            msg,
            WireMessage::Event {
                event: "provider-added".to_string(),
                payload: json!({"providerId": 4}),
            }
        );
    }

    #[test]
    fn test_parse_event_without_payload() {
        let msg = WireMessage::parse(r#"{"event":"plugins-changed"}"#).unwrap();
        assert!(matches!(msg, WireMessage::Event { payload, .. } if payload.is_null()));
    }

    #[test]
    fn test_parse_status_line() {
        let msg = WireMessage::parse(r#"{"status":"reconnecting","reconnectAttempts":2}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::Status(ConnectionStatusPayload::new(ConnectionStatus::Reconnecting, 2))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            WireMessage::parse("not json"),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            WireMessage::parse(r#"{"kind":"x"}"#),
            Err(Error::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_bridge_publishes_and_skips_malformed() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _events = bus
            .subscribe_now(
                "pipelines-updated",
                handler(move |p| sink.lock().unwrap().push(p)),
            )
            .unwrap();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let status_sink = Arc::clone(&statuses);
        let _status = bus
            .subscribe_now(
                CONNECTION_STATUS_EVENT,
                handler(move |p| status_sink.lock().unwrap().push(p)),
            )
            .unwrap();

        let input = concat!(
            "{\"status\":\"connected\"}\n",
            "\n",
            "{\"event\":\"pipelines-updated\",\"payload\":{\"providerId\":1,\"pipelines\":[]}}\n",
            "garbage\n",
        );
        let stats = run_bridge(input.as_bytes(), bus.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            BridgeStats {
                published: 2,
                malformed: 1
            }
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(statuses.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_unknown_status_keeps_fields() {
        let msg = WireMessage::parse(r#"{"status":"flaky","reconnectAttempts":3}"#).unwrap();
        let WireMessage::UnknownStatus { status, rest } = msg else {
            panic!("expected an unknown status");
        };
        assert_eq!(status, json!("flaky"));
        assert_eq!(rest.get("reconnectAttempts"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_bridge_forwards_unknown_status() {
        let bus = EventBus::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let _status = bus
            .subscribe_now(
                CONNECTION_STATUS_EVENT,
                handler(move |p| sink.lock().unwrap().push(p)),
            )
            .unwrap();

        let input = "{\"status\":\"flaky\"}\n{\"status\":\"connected\"}\n";
        let stats = run_bridge(input.as_bytes(), bus.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.published, 2);
        assert_eq!(stats.malformed, 0);
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses[0], json!({"status": "flaky"}));
        assert_eq!(statuses[1]["status"], json!("connected"));
    }

    #[tokio::test]
    async fn test_bridge_skips_invalid_utf8_line() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _events = bus
            .subscribe_now(
                "plugins-changed",
                handler(move |p| sink.lock().unwrap().push(p)),
            )
            .unwrap();

        let mut input = b"{\"event\":\"plugins-changed\"}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"event\":\"plugins-changed\"}");
        let stats = run_bridge(input.as_slice(), bus.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            BridgeStats {
                published: 2,
                malformed: 1
            }
        );
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bridge_stops_on_cancel() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = run_bridge(tokio::io::BufReader::new(client), EventBus::new(), cancel)
            .await
            .unwrap();
        assert_eq!(stats, BridgeStats::default());
    }

    #[tokio::test]
    async fn test_bridge_fails_when_bus_closed() {
        let bus = EventBus::new();
        bus.shutdown();
        let input = "{\"event\":\"plugins-changed\"}\n";
        let result = run_bridge(input.as_bytes(), bus, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Closed)));
    }
}
