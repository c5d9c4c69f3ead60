//! Stream module - relay push channel
//!
//! Transports:
//! - Long-polling (store-and-forward, connected first)
//! - WebSocket (persistent, tried as an upgrade)

pub mod polling;
pub mod relay;
pub mod supervisor;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use relay::RelayTransportFactory;
pub use supervisor::{ConnectionRecord, ConnectionStatus, ConnectionSupervisor, FrameSink};
pub use transport::{RawFrame, Transport, TransportFactory, TransportKind};
