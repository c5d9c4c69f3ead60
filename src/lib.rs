//! dApp Bridge Library
//!
//! Surfaces signing requests pushed by a wallet-connection relay, one at a
//! time, and retires each one exactly once: on the user's answer or at its
//! deadline.

pub mod cli;
pub mod config;
pub mod error;
pub mod session;
pub mod stream;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use session::{Identity, Manager, PendingRequest, Resolution};
pub use stream::{ConnectionRecord, ConnectionStatus};
