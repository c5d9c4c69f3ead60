//! Wire event normalization
//!
//! The relay has shipped the same logical event under several names over time
//! (`newRequest`, `new_request`, `NEW_REQUEST`, ...). Everything downstream only
//! ever sees [`CanonicalEvent`]. Frames addressed to another user never get past
//! this point.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::session::types::{Identity, PendingRequest, SessionRecord};
use crate::stream::transport::RawFrame;

/// Logical wire events the bridge understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEvent {
    NewRequest,
    NewConnection,
}

/// Known spellings, matched case-insensitively
const EVENT_NAMES: &[(&str, WireEvent)] = &[
    ("newRequest", WireEvent::NewRequest),
    ("new_request", WireEvent::NewRequest),
    ("new-request", WireEvent::NewRequest),
    ("newConnection", WireEvent::NewConnection),
    ("new_connection", WireEvent::NewConnection),
    ("new-connection", WireEvent::NewConnection),
];

/// Map a wire event name onto its logical event; unknown names are `None`
pub fn classify(name: &str) -> Option<WireEvent> {
    let name = name.trim();
    EVENT_NAMES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|(_, event)| *event)
}

/// Normalized event handed to the registry
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    RequestAdmitted(PendingRequest),
    ConnectionAnnounced(SessionRecord),
}

/// Why a frame was dropped
#[derive(Debug, Clone, PartialEq)]
pub enum Dropped {
    UnknownEvent(String),
    WrongRecipient(String),
    MissingRecipient,
    Malformed(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "userId", alias = "user_id")]
    user_id: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    chain_id: Option<Value>,
    dapp_name: Option<String>,
    dapp_url: Option<String>,
    dapp_icon: Option<String>,
    created_at: Option<Value>,
    expires_at: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSession {
    topic: Option<String>,
    dapp_name: Option<String>,
    dapp_url: Option<String>,
    dapp_icon: Option<String>,
    chain_id: Option<Value>,
    connected_at: Option<Value>,
}

/// Stateless frame normalizer scoped to one identity
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    identity: Identity,
    accept_unscoped_connections: bool,
}

impl EventNormalizer {
    pub fn new(identity: Identity, accept_unscoped_connections: bool) -> Self {
        Self {
            identity,
            accept_unscoped_connections,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Normalize a frame, logging and swallowing anything that is dropped.
    ///
    /// `now` stands in for `createdAt`/`connectedAt` when the relay omits them.
    pub fn normalize(&self, frame: &RawFrame, now: DateTime<Utc>) -> Option<CanonicalEvent> {
        match self.try_normalize(frame, now) {
            Ok(event) => Some(event),
            Err(Dropped::UnknownEvent(name)) => {
                debug!(event = %name, "Ignoring unknown relay event");
                None
            }
            Err(Dropped::WrongRecipient(user_id)) => {
                debug!(event = %frame.event, user_id = %user_id, "Dropping event for another user");
                None
            }
            Err(Dropped::MissingRecipient) => {
                debug!(event = %frame.event, "Dropping unscoped event");
                None
            }
            Err(Dropped::Malformed(reason)) => {
                warn!(event = %frame.event, "Dropping malformed event: {}", reason);
                None
            }
        }
    }

    /// Normalize a frame, reporting why it was dropped
    pub fn try_normalize(
        &self,
        frame: &RawFrame,
        now: DateTime<Utc>,
    ) -> Result<CanonicalEvent, Dropped> {
        let kind = classify(&frame.event).ok_or_else(|| Dropped::UnknownEvent(frame.event.clone()))?;

        let envelope: Envelope = serde_json::from_value(frame.payload.clone())
            .map_err(|e| Dropped::Malformed(format!("bad envelope: {}", e)))?;

        if let Some(message) = &envelope.message {
            debug!(event = %frame.event, "Relay message: {}", message);
        }

        let user_id = match &envelope.user_id {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                value_to_string(raw)
                    .ok_or_else(|| Dropped::Malformed(format!("unusable userId {}", raw)))?,
            ),
        };
        match (&user_id, kind) {
            (Some(user_id), _) if !self.identity.matches(user_id) => {
                return Err(Dropped::WrongRecipient(user_id.clone()));
            }
            (Some(_), _) => {}
            (None, WireEvent::NewConnection) if self.accept_unscoped_connections => {}
            (None, _) => return Err(Dropped::MissingRecipient),
        }

        let data = envelope
            .data
            .ok_or_else(|| Dropped::Malformed("missing data".to_string()))?;

        match kind {
            WireEvent::NewRequest => build_request(data, now).map(CanonicalEvent::RequestAdmitted),
            WireEvent::NewConnection => {
                build_session(data, now).map(CanonicalEvent::ConnectionAnnounced)
            }
        }
    }
}

fn build_request(data: Value, now: DateTime<Utc>) -> Result<PendingRequest, Dropped> {
    let wire: WireRequest = serde_json::from_value(data)
        .map_err(|e| Dropped::Malformed(format!("bad request payload: {}", e)))?;

    let id = wire
        .id
        .as_ref()
        .and_then(value_to_string)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Dropped::Malformed("request without id".to_string()))?;

    let expires_at = wire
        .expires_at
        .as_ref()
        .ok_or_else(|| Dropped::Malformed(format!("request {} without expiresAt", id)))
        .and_then(|v| {
            parse_timestamp(v)
                .ok_or_else(|| Dropped::Malformed(format!("request {} has bad expiresAt", id)))
        })?;

    let created_at = match &wire.created_at {
        Some(v) => parse_timestamp(v)
            .ok_or_else(|| Dropped::Malformed(format!("request {} has bad createdAt", id)))?,
        None => now,
    };

    if expires_at <= created_at {
        return Err(Dropped::Malformed(format!(
            "request {} expires at or before its creation",
            id
        )));
    }

    Ok(PendingRequest {
        id,
        method: wire.method.unwrap_or_default(),
        params: wire.params,
        chain_id: wire.chain_id.as_ref().and_then(value_to_string),
        dapp_name: wire.dapp_name.unwrap_or_default(),
        dapp_url: wire.dapp_url.unwrap_or_default(),
        dapp_icon: wire.dapp_icon,
        created_at,
        expires_at,
    })
}

fn build_session(data: Value, now: DateTime<Utc>) -> Result<SessionRecord, Dropped> {
    let wire: WireSession = serde_json::from_value(data)
        .map_err(|e| Dropped::Malformed(format!("bad connection payload: {}", e)))?;

    let connected_at = match &wire.connected_at {
        Some(v) => parse_timestamp(v)
            .ok_or_else(|| Dropped::Malformed("bad connectedAt".to_string()))?,
        None => now,
    };

    Ok(SessionRecord {
        topic: wire.topic,
        dapp_name: wire.dapp_name,
        dapp_url: wire.dapp_url,
        dapp_icon: wire.dapp_icon,
        chain_id: wire.chain_id.as_ref().and_then(value_to_string),
        connected_at,
    })
}

/// Strings pass through, numbers are stringified (chain ids, numeric user ids)
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 strings or epoch milliseconds
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
