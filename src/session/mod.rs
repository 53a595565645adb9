//! Terminal Session Module
//!
//! - [`TerminalSession`]: one terminal, its transport and output history
//! - [`FlowGate`]: HIGH/LOW watermark plus explicit-pause backpressure
//! - [`RingBuffer`]: bounded line history for replay and output queries
//! - [`SessionRegistry`]: bound sessions by id, with the grace-period sweep

pub mod flow;
pub mod registry;
pub mod ring_buffer;
pub mod terminal;

use thiserror::Error;

use crate::transport::TransportError;

pub use flow::{FlowGate, FlowSnapshot};
pub use registry::SessionRegistry;
pub use ring_buffer::RingBuffer;
pub use terminal::{Attachment, Outbound, SessionInfo, SessionState, TerminalSession};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is closed")]
    Closed(String),

    #[error("Session {0} has no transport yet")]
    NotReady(String),

    #[error("Session {0} already has a transport")]
    AlreadyStarted(String),

    #[error("Session id {0} is already in use")]
    IdInUse(String),

    #[error("Session {id} belongs to asset {asset}")]
    AssetMismatch { id: String, asset: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "not_found",
            SessionError::Closed(_) => "closed",
            SessionError::NotReady(_) => "not_ready",
            SessionError::AlreadyStarted(_)
            | SessionError::IdInUse(_)
            | SessionError::AssetMismatch { .. } => "conflict",
            SessionError::Transport(e) => e.kind(),
        }
    }
}
