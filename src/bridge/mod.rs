//! Terminal WebSocket bridge
//!
//! [`TerminalServer`] accepts one WebSocket per terminal and wires it to a
//! [`TerminalSession`](crate::session::TerminalSession); [`protocol`] holds
//! the JSON envelope.

pub mod protocol;
pub mod server;

use thiserror::Error;

pub use protocol::{decode, ClientMessage, Inbound, ProtocolError, ServerMessage};
pub use server::{TerminalRequest, TerminalServer};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to bind terminal listener {0}")]
    Bind(String),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Failed to open terminal: {0}")]
    Open(String),
}
