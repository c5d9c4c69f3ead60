//! Relay transport abstraction and wire frame envelope
//!
//! The relay pushes events either as Socket.IO-style arrays
//! (`["newRequest", {...}]`) or as objects (`{"event": "...", "payload": {...}}`).
//! A polling response carries a JSON array of such frames.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};
use crate::session::types::Identity;

/// Transports the relay speaks, in increasing capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Store-and-forward long polling
    Polling,
    /// Persistent streaming socket
    #[serde(alias = "ws")]
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Polling => f.write_str("polling"),
            TransportKind::WebSocket => f.write_str("websocket"),
        }
    }
}

/// One undecoded event as delivered by the relay
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Wire event name, in whatever spelling the relay used
    pub event: String,
    pub payload: Value,
}

#[derive(Deserialize)]
struct ObjectFrame {
    #[serde(alias = "type", alias = "name")]
    event: String,
    #[serde(default, alias = "data")]
    payload: Value,
}

impl RawFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Parse a single text frame
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Parse a polling response body into frames, skipping malformed entries
    pub fn parse_batch(text: &str) -> Result<Vec<Self>> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) if items.first().map_or(true, |v| !v.is_string()) => Ok(items
                .into_iter()
                .filter_map(|item| match Self::from_value(item) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        tracing::warn!("Skipping malformed frame in batch: {}", e);
                        None
                    }
                })
                .collect()),
            // A lone array frame: ["event", payload]
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(mut items) => {
                if items.is_empty() {
                    return Err(Error::MalformedFrame("empty array frame".to_string()));
                }
                let payload = if items.len() > 1 {
                    items.swap_remove(1)
                } else {
                    Value::Null
                };
                match items.swap_remove(0) {
                    Value::String(event) => Ok(Self { event, payload }),
                    other => Err(Error::MalformedFrame(format!(
                        "event name must be a string, got {}",
                        other
                    ))),
                }
            }
            Value::Object(_) => {
                let frame: ObjectFrame = serde_json::from_value(value)
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                Ok(Self {
                    event: frame.event,
                    payload: frame.payload,
                })
            }
            other => Err(Error::MalformedFrame(format!("unexpected frame: {}", other))),
        }
    }
}

/// A connected relay transport
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Wait for the next batch of inbound frames (possibly empty for an idle
    /// long-poll). `Ok(None)` means the relay closed the channel.
    async fn recv(&mut self) -> Result<Option<Vec<RawFrame>>>;

    /// Frames already taken off the relay but not yet returned by `recv`.
    /// The supervisor drains these before closing a transport it upgrades away from.
    fn take_buffered(&mut self) -> Vec<RawFrame> {
        Vec::new()
    }

    /// Close the transport; must tolerate being called on a dead connection
    async fn close(&mut self);
}

/// Opens transports; injected into the supervisor so tests can script the relay
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, kind: TransportKind, identity: &Identity) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_array_frame() {
        let frame = RawFrame::parse(r#"["newRequest", {"userId": "u1"}]"#).unwrap();
        assert_eq!(frame.event, "newRequest");
        assert_eq!(frame.payload, json!({"userId": "u1"}));
    }

    #[test]
    fn test_parse_object_frame() {
        let frame = RawFrame::parse(r#"{"event": "new_connection", "payload": {"message": "hi"}}"#)
            .unwrap();
        assert_eq!(frame.event, "new_connection");
        assert_eq!(frame.payload["message"], "hi");

        let frame = RawFrame::parse(r#"{"type": "NEW_REQUEST", "data": {}}"#).unwrap();
        assert_eq!(frame.event, "NEW_REQUEST");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RawFrame::parse("42").is_err());
        assert!(RawFrame::parse("[]").is_err());
        assert!(RawFrame::parse("[1, {}]").is_err());
        assert!(RawFrame::parse("not json").is_err());
    }

    #[test]
    fn test_parse_batch() {
        let frames = RawFrame::parse_batch(
            r#"[["newRequest", {}], {"event": "newConnection", "payload": {}}, 7]"#,
        )
        .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].event, "newConnection");

        let single = RawFrame::parse_batch(r#"["newRequest", {}]"#).unwrap();
        assert_eq!(single.len(), 1);

        assert!(RawFrame::parse_batch("[]").unwrap().is_empty());
    }
}
