//! Relay connection lifecycle
//!
//! ```text
//! Disconnected --start--> Connecting --ack--> Connected --drop--> Reconnecting
//!      ^                      |                   ^                  |   |
//!      |                      +------fail---------|----------------->+   |
//!      +------------- stop() / give up -----------+------------success---+
//! ```
//!
//! The first configured transport is connected, then the remaining ones are
//! tried as upgrades. A failed upgrade is logged and the current transport
//! stays in use. Every inbound frame goes straight to the frame sink on the
//! supervisor task.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::session::types::Identity;
use crate::stream::transport::{RawFrame, Transport, TransportFactory, TransportKind};

/// Receives every inbound frame, synchronously, in delivery order
pub type FrameSink = Arc<dyn Fn(RawFrame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection state reported to consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub status: ConnectionStatus,
    /// Active transport while connected
    pub transport: Option<TransportKind>,
    pub last_error: Option<String>,
}

impl ConnectionRecord {
    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            transport: None,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl Default for ConnectionRecord {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// How a connected session ended
enum SessionEnd {
    Shutdown,
    Dropped(Option<String>),
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared with the connection task
struct Shared {
    config: RelayConfig,
    factory: Arc<dyn TransportFactory>,
    status_tx: watch::Sender<ConnectionRecord>,
}

pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ConnectionSupervisor {
    pub fn new(config: RelayConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionRecord::disconnected());
        Self {
            shared: Arc::new(Shared {
                config,
                factory,
                status_tx,
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the connection task. Must be called from within a tokio runtime.
    pub fn start(&self, identity: Identity, sink: FrameSink) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        info!(user_id = %identity, "Starting relay connection supervisor");

        let shutdown = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            shared.run(identity, sink, task_shutdown).await;
        });

        *running = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Tear down the channel, including any in-flight handshake or reconnect
    /// delay. Idempotent.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(running) = running {
            info!("Stopping relay connection supervisor");
            running.shutdown.cancel();
            if let Err(e) = running.handle.await {
                error!("Relay connection task failed: {}", e);
            }
        }

        let last_error = self.shared.status_tx.borrow().last_error.clone();
        self.shared
            .set_status(ConnectionStatus::Disconnected, None, last_error);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    pub fn status(&self) -> ConnectionRecord {
        self.shared.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionRecord> {
        self.shared.status_tx.subscribe()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.shutdown.cancel();
                running.handle.abort();
            }
        }
    }
}

impl Shared {
    async fn run(&self, identity: Identity, sink: FrameSink, shutdown: CancellationToken) {
        let mut failures = 0u32;
        self.set_status(ConnectionStatus::Connecting, None, None);

        loop {
            match self.connect_and_stream(&identity, &sink, &shutdown, &mut failures).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Dropped(reason)) => {
                    warn!("Relay connection dropped: {}", reason.as_deref().unwrap_or("closed"));
                    self.set_status(ConnectionStatus::Reconnecting, None, reason);
                }
                Err(e) if !e.is_retryable() => {
                    error!("Relay connection failed permanently: {}", e);
                    self.set_status(ConnectionStatus::Disconnected, None, Some(e.to_string()));
                    return;
                }
                Err(e) => {
                    error!("Relay connection error: {}", e);
                    failures += 1;

                    let max = self.config.max_reconnect_attempts;
                    if max > 0 && failures >= max {
                        error!("Max reconnect attempts ({}) reached", max);
                        self.set_status(ConnectionStatus::Disconnected, None, Some(e.to_string()));
                        return;
                    }
                    self.set_status(ConnectionStatus::Reconnecting, None, Some(e.to_string()));
                }
            }

            // Wait before reconnecting
            let delay = Duration::from_millis(self.config.reconnect_delay_ms);
            warn!("Reconnecting in {:?}...", delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        let last_error = self.status_tx.borrow().last_error.clone();
        self.set_status(ConnectionStatus::Disconnected, None, last_error);
        info!("Relay connection supervisor stopped");
    }

    /// Connect, try upgrades, then pump frames until the session ends.
    /// Errors are connection failures; a drop after connecting is `Dropped`.
    async fn connect_and_stream(
        &self,
        identity: &Identity,
        sink: &FrameSink,
        shutdown: &CancellationToken,
        failures: &mut u32,
    ) -> Result<SessionEnd> {
        let (first, upgrades) = self
            .config
            .transports
            .split_first()
            .ok_or_else(|| Error::Config("no relay transports configured".to_string()))?;

        let mut transport = match self.handshake(*first, identity, shutdown).await? {
            Some(transport) => transport,
            None => return Ok(SessionEnd::Shutdown),
        };

        *failures = 0;
        self.set_status(ConnectionStatus::Connected, Some(transport.kind()), None);
        deliver(sink, transport.take_buffered());

        if self.config.upgrade {
            for kind in upgrades {
                match self.handshake(*kind, identity, shutdown).await {
                    Ok(Some(upgraded)) => {
                        info!("Upgraded relay transport {} -> {}", transport.kind(), kind);
                        deliver(sink, transport.take_buffered());
                        transport.close().await;
                        transport = upgraded;
                        self.set_status(ConnectionStatus::Connected, Some(*kind), None);
                    }
                    Ok(None) => {
                        transport.close().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                    Err(e) => {
                        warn!("Transport upgrade to {} failed, staying on {}: {}", kind, transport.kind(), e);
                    }
                }
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    transport.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                received = transport.recv() => match received {
                    Ok(Some(frames)) => deliver(sink, frames),
                    Ok(None) => {
                        transport.close().await;
                        return Ok(SessionEnd::Dropped(None));
                    }
                    Err(e) => {
                        transport.close().await;
                        return Ok(SessionEnd::Dropped(Some(e.to_string())));
                    }
                }
            }
        }
    }

    /// Open one transport within the handshake bound. `None` means shutdown won.
    async fn handshake(
        &self,
        kind: TransportKind,
        identity: &Identity,
        shutdown: &CancellationToken,
    ) -> Result<Option<Box<dyn Transport>>> {
        let limit_ms = self.config.handshake_timeout_ms;
        debug!("Opening {} transport", kind);

        tokio::select! {
            _ = shutdown.cancelled() => Ok(None),
            result = timeout(Duration::from_millis(limit_ms), self.factory.connect(kind, identity)) => {
                match result {
                    Ok(Ok(transport)) => Ok(Some(transport)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::HandshakeTimeout(limit_ms)),
                }
            }
        }
    }

    fn set_status(
        &self,
        status: ConnectionStatus,
        transport: Option<TransportKind>,
        last_error: Option<String>,
    ) {
        let next = ConnectionRecord {
            status,
            transport,
            last_error,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?current.status, to = ?next.status, transport = ?next.transport, "Connection status");
            *current = next;
            true
        });
    }
}

fn deliver(sink: &FrameSink, frames: Vec<RawFrame>) {
    for frame in frames {
        debug!(event = %frame.event, "Relay frame");
        sink(frame);
    }
}
