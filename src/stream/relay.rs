//! Transport factory for the production relay

use async_trait::async_trait;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::session::types::Identity;
use crate::stream::polling::PollingTransport;
use crate::stream::transport::{Transport, TransportFactory, TransportKind};
use crate::stream::websocket::WebSocketTransport;

/// Opens polling and WebSocket transports against the configured relay
pub struct RelayTransportFactory {
    config: RelayConfig,
    client: reqwest::Client,
    /// Stable per-process id so the relay can pair polling and upgraded sockets
    client_id: String,
}

impl RelayTransportFactory {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dapp-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            client,
            client_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Relay endpoint scoped to `identity`
    pub fn endpoint(&self, kind: TransportKind, identity: &Identity) -> Result<Url> {
        let base = match kind {
            TransportKind::Polling => &self.config.http_url,
            TransportKind::WebSocket => &self.config.ws_url,
        };
        let mut url = Url::parse(base)
            .map_err(|e| Error::Config(format!("Invalid {} URL {}: {}", kind, base, e)))?;
        url.query_pairs_mut()
            .append_pair("userId", identity.as_str())
            .append_pair("clientId", &self.client_id)
            .append_pair("transport", &kind.to_string());
        Ok(url)
    }
}

#[async_trait]
impl TransportFactory for RelayTransportFactory {
    async fn connect(&self, kind: TransportKind, identity: &Identity) -> Result<Box<dyn Transport>> {
        let url = self.endpoint(kind, identity)?;
        match kind {
            TransportKind::Polling => {
                let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);
                let transport = PollingTransport::connect(self.client.clone(), url, poll_timeout).await?;
                Ok(Box::new(transport))
            }
            TransportKind::WebSocket => {
                let ping_interval = Duration::from_secs(self.config.ping_interval_secs);
                let transport = WebSocketTransport::connect(url, ping_interval).await?;
                Ok(Box::new(transport))
            }
        }
    }
}
