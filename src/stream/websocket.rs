//! Persistent WebSocket transport to the relay
//!
//! Endpoint: `{relay.ws_url}?userId=<id>&clientId=<uuid>`. The relay pushes one
//! JSON frame per text message; we keep the socket alive with periodic pings.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Result;
use crate::stream::transport::{RawFrame, Transport, TransportKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket relay transport
pub struct WebSocketTransport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping_timer: Interval,
}

impl WebSocketTransport {
    /// Connect and complete the WebSocket handshake
    pub async fn connect(url: Url, ping_interval: Duration) -> Result<Self> {
        info!("Connecting to relay WebSocket...");

        let (ws_stream, _) = connect_async(url).await?;

        info!("Connected to relay WebSocket");

        let (write, read) = ws_stream.split();
        let ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);

        Ok(Self {
            write,
            read,
            ping_timer,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn recv(&mut self) -> Result<Option<Vec<RawFrame>>> {
        loop {
            tokio::select! {
                // Ping to keep connection alive
                _ = self.ping_timer.tick() => {
                    self.write.send(Message::Ping(vec![])).await?;
                    debug!("Sent ping");
                }

                // Receive messages
                msg = self.read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match RawFrame::parse(&text) {
                            Ok(frame) => return Ok(Some(vec![frame])),
                            Err(e) => {
                                warn!("Failed to parse relay frame: {}", e);
                            }
                        },
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong");
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by relay");
                            return Ok(None);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            info!("WebSocket stream ended");
                            return Ok(None);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.send(Message::Close(None)).await {
            debug!("Close frame not sent: {}", e);
        }
        let _ = self.write.close().await;
    }
}
