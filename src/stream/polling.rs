//! Store-and-forward long-poll transport
//!
//! The relay queues events per user; each `GET {relay.http_url}?userId=..`
//! returns whatever is queued (a JSON array of frames) or blocks until
//! something arrives or the poll times out. Nothing is lost while we are
//! between polls, which is why this is the first transport we connect.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::stream::transport::{RawFrame, Transport, TransportKind};

pub struct PollingTransport {
    client: reqwest::Client,
    url: Url,
    poll_timeout: Duration,
    /// Frames delivered by the handshake poll, handed out on the first recv
    pending: Vec<RawFrame>,
}

impl PollingTransport {
    /// Perform the handshake poll. Success means the relay accepted us.
    pub async fn connect(client: reqwest::Client, url: Url, poll_timeout: Duration) -> Result<Self> {
        info!("Connecting to relay via long-polling...");

        let mut transport = Self {
            client,
            url,
            poll_timeout,
            pending: Vec::new(),
        };
        // The handshake must answer promptly, so no long-poll wait here
        transport.pending = transport.poll(false).await?;

        info!("Connected to relay (polling)");
        Ok(transport)
    }

    async fn poll(&self, wait: bool) -> Result<Vec<RawFrame>> {
        let mut request = self.client.get(self.url.clone());
        if wait {
            request = request.query(&[("wait", "1")]).timeout(self.poll_timeout);
        }

        let response = match request.send().await {
            Ok(response) => response,
            // An idle long-poll simply times out
            Err(e) if wait && e.is_timeout() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        match response.status() {
            StatusCode::NO_CONTENT => return Ok(Vec::new()),
            StatusCode::GONE => return Err(Error::ChannelClosed),
            status if !status.is_success() => {
                return Err(Error::Transport(format!("relay poll returned {}", status)));
            }
            _ => {}
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }

        match RawFrame::parse_batch(&body) {
            Ok(frames) => {
                debug!("Polled {} frame(s)", frames.len());
                Ok(frames)
            }
            Err(e) => {
                warn!("Discarding unparseable poll response: {}", e);
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn recv(&mut self) -> Result<Option<Vec<RawFrame>>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        match self.poll(true).await {
            Ok(frames) => Ok(Some(frames)),
            Err(Error::ChannelClosed) => {
                info!("Relay closed the polling session");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn take_buffered(&mut self) -> Vec<RawFrame> {
        std::mem::take(&mut self.pending)
    }

    async fn close(&mut self) {
        self.pending.clear();
        debug!("Polling transport closed");
    }
}
