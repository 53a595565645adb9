//! Port Forwarding Module
//!
//! SSH tunnels over pooled connections: local (-L), remote (-R) and dynamic
//! SOCKS (-D) forwards, managed as persistent [`TunnelSpec`]s by the
//! [`TunnelManager`].

mod dynamic;
mod events;
mod local;
pub mod manager;
pub mod relay;
pub mod remote;

use thiserror::Error;

use crate::ssh::PoolError;
use crate::transport::TransportError;

pub use events::{BroadcastEmitter, EventEmitter, NoopEmitter, TunnelEvent};
pub use manager::{TunnelManager, TunnelSpec, TunnelStatus, TunnelType, TunnelUpdate};
pub use relay::{RelayOptions, TunnelStats};
pub use remote::{handle_forwarded_connection, RemoteForwardRouter, RemoteRoute};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Invalid tunnel spec: {0}")]
    Validation(String),

    #[error("Tunnel {0} is running")]
    AlreadyRunning(String),

    #[error("Tunnel {0} was stopped before it started")]
    Stopped(String),

    /// Listener could not be bound (local or on the server)
    #[error("{0}")]
    Resource(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<PoolError> for TunnelError {
    fn from(err: PoolError) -> Self {
        TunnelError::Transport(err.into())
    }
}
