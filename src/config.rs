//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

// Re-export transport kind so config files can name transports
pub use crate::stream::transport::TransportKind;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub requests: RequestConfig,
}

/// Relay push-channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Long-poll endpoint for the store-and-forward transport
    #[serde(default = "default_http_url")]
    pub http_url: String,
    /// Streaming endpoint for the persistent transport
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Transports in connection order; the first is connected, the rest are upgrades
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,
    /// Attempt upgrades after the first transport connects
    #[serde(default = "default_true")]
    pub upgrade: bool,
    /// Bound on every transport handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Reconnect delay in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Maximum reconnect attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Ping interval in seconds (websocket only)
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Long-poll request timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

/// Request/session handling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    /// Accept "new connection" events that carry no userId
    #[serde(default = "default_true")]
    pub accept_unscoped_connections: bool,
    /// Capacity of the settled/invalidation/session broadcast channels
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_http_url() -> String {
    "https://relay.example.com/events".to_string()
}

fn default_ws_url() -> String {
    "wss://relay.example.com/ws".to_string()
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::Polling, TransportKind::WebSocket]
}

fn default_handshake_timeout_ms() -> u64 {
    20_000
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_ping_interval_secs() -> u64 {
    25
}

fn default_poll_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
            transports: default_transports(),
            upgrade: true,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: 0,
            ping_interval_secs: default_ping_interval_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            accept_unscoped_connections: true,
            event_buffer: default_event_buffer(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("relay.http_url", default_http_url())?
            .set_default("relay.ws_url", default_ws_url())?
            .set_default(
                "relay.handshake_timeout_ms",
                default_handshake_timeout_ms() as i64,
            )?
            .set_default("relay.reconnect_delay_ms", default_reconnect_delay_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix DAPP_BRIDGE_)
            .add_source(
                config::Environment::with_prefix("DAPP_BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;

        if relay.transports.is_empty() {
            anyhow::bail!("relay.transports must name at least one transport");
        }

        for (i, kind) in relay.transports.iter().enumerate() {
            if relay.transports[..i].contains(kind) {
                anyhow::bail!("relay.transports lists {} twice", kind);
            }
        }

        if relay.transports.contains(&TransportKind::Polling) {
            let url = url::Url::parse(&relay.http_url)
                .with_context(|| format!("Invalid relay.http_url: {}", relay.http_url))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("relay.http_url must be http(s), got {}", url.scheme());
            }
        }

        if relay.transports.contains(&TransportKind::WebSocket) {
            let url = url::Url::parse(&relay.ws_url)
                .with_context(|| format!("Invalid relay.ws_url: {}", relay.ws_url))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                anyhow::bail!("relay.ws_url must be ws(s), got {}", url.scheme());
            }
        }

        if relay.handshake_timeout_ms == 0 {
            anyhow::bail!("relay.handshake_timeout_ms must be positive");
        }

        if relay.ping_interval_secs == 0 {
            anyhow::bail!("relay.ping_interval_secs must be positive");
        }

        if relay.poll_timeout_ms == 0 {
            anyhow::bail!("relay.poll_timeout_ms must be positive");
        }

        if self.requests.event_buffer == 0 {
            anyhow::bail!("requests.event_buffer must be positive");
        }

        if !self.requests.accept_unscoped_connections {
            tracing::info!("Unscoped \"new connection\" events will be dropped");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Relay:
    http_url: {}
    ws_url: {}
    transports: {:?}
    upgrade: {}
    handshake_timeout: {}ms
    reconnect_delay: {}ms
    max_reconnect_attempts: {}
    ping_interval: {}s
    poll_timeout: {}ms
  Requests:
    accept_unscoped_connections: {}
    event_buffer: {}
"#,
            mask_url(&self.relay.http_url),
            mask_url(&self.relay.ws_url),
            self.relay.transports,
            self.relay.upgrade,
            self.relay.handshake_timeout_ms,
            self.relay.reconnect_delay_ms,
            self.relay.max_reconnect_attempts,
            self.relay.ping_interval_secs,
            self.relay.poll_timeout_ms,
            self.requests.accept_unscoped_connections,
            self.requests.event_buffer,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
