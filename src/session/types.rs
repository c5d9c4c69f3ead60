//! Core data types shared by the request/session bridge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Logical user the manager is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Create an identity; blank ids are rejected
    pub fn new(user_id: impl Into<String>) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(Error::InvalidIdentity("user id must not be empty".to_string()));
        }
        Ok(Self(user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a wire `userId` addresses this identity
    pub fn matches(&self, user_id: &str) -> bool {
        self.0 == user_id
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An action a dApp asked the wallet to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    /// Opaque unique id assigned by the relay
    pub id: String,
    /// Requested operation, e.g. `eth_sendTransaction`
    pub method: String,
    /// Operation payload, passed through untouched
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub chain_id: Option<String>,
    pub dapp_name: String,
    pub dapp_url: String,
    #[serde(default)]
    pub dapp_icon: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRequest {
    /// Time left until the deadline, zero if it already passed
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A completed dApp connection announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub dapp_name: Option<String>,
    #[serde(default)]
    pub dapp_url: Option<String>,
    #[serde(default)]
    pub dapp_icon: Option<String>,
    #[serde(default)]
    pub chain_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// How the user answered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Approved,
    Rejected,
    Dismissed,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Approved => f.write_str("approved"),
            Resolution::Rejected => f.write_str("rejected"),
            Resolution::Dismissed => f.write_str("dismissed"),
        }
    }
}

/// The single outcome every admitted request ends with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Resolved(Resolution),
    Expired,
}

/// Broadcast when a request leaves the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettled {
    pub request: PendingRequest,
    pub outcome: RequestOutcome,
}
