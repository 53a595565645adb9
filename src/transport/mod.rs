//! Asset transports
//!
//! A terminal talks to its target through an [`AssetTransport`], picked once
//! at open time:
//!
//! - `Local`: a shell spawned under a pseudo-terminal on this machine
//! - `SshShell`: a PTY + shell on a session channel of the asset's pooled
//!   SSH connection
//!
//! Every variant has the same contract: `write` input, `resize` the window,
//! `close` (idempotent), and an output queue of [`TransportEvent`]s handed
//! out at open time. The queue is bounded, so a consumer that stops reading
//! stops the transport from reading its source.
//!
//! Tunnels use the forwarding flavour, [`DirectTcpip`], which yields raw
//! duplex streams for relaying instead of terminal events.

#[cfg(feature = "local-terminal")]
pub mod local;
#[cfg(test)]
pub(crate) mod loopback;
pub mod ssh;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::info;

use crate::asset::{Asset, AssetTarget};
use crate::config::LocalShellConfig;
use crate::ssh::{ConnectionPool, PoolError, SshError};

pub use ssh::{DirectTcpip, SshShell};

/// Output side of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(Bytes),
    /// The remote process ended (exit status when known)
    Exited(Option<u32>),
    /// The transport broke mid-session
    Failed(String),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Transport closed")]
    Closed,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl TransportError {
    /// Stable machine-readable name, used in error frames and tunnel status
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::ConnectionRefused(_) => "connection_refused",
            TransportError::AuthFailed(_) => "auth_failed",
            TransportError::HostUnreachable(_) => "host_unreachable",
            TransportError::Timeout(_) => "timeout",
            TransportError::Io(_) => "io",
            TransportError::Channel(_) => "channel",
            TransportError::Closed => "closed",
            TransportError::Unsupported(_) => "unsupported",
            TransportError::NotFound(_) => "not_found",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => TransportError::Timeout(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

impl From<SshError> for TransportError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::ConnectionRefused(m) => TransportError::ConnectionRefused(m),
            SshError::HostUnreachable(m) => TransportError::HostUnreachable(m),
            SshError::AuthenticationFailed(m)
            | SshError::KeyError(m)
            | SshError::CertificateError(m) => TransportError::AuthFailed(m),
            SshError::Timeout(m) => TransportError::Timeout(m),
            SshError::ChannelError(m) => TransportError::Channel(m),
            SshError::IoError(e) => TransportError::Io(e.to_string()),
            SshError::Disconnected => TransportError::Closed,
            other => TransportError::Channel(other.to_string()),
        }
    }
}

impl From<PoolError> for TransportError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ConnectionRefused(m) => TransportError::ConnectionRefused(m),
            PoolError::AuthFailed(m) => TransportError::AuthFailed(m),
            PoolError::HostUnreachable(m) => TransportError::HostUnreachable(m),
            PoolError::Timeout(m) => TransportError::Timeout(m),
            PoolError::AssetNotFound(id) => TransportError::NotFound(format!("asset {}", id)),
            PoolError::NotSsh(id) => {
                TransportError::Unsupported(format!("asset {} is not an SSH asset", id))
            }
            PoolError::Closed => TransportError::Closed,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// A terminal transport, chosen once at open time
pub enum AssetTransport {
    #[cfg(feature = "local-terminal")]
    Local(local::LocalPty),
    SshShell(SshShell),
    #[cfg(test)]
    Loopback(loopback::Loopback),
}

impl AssetTransport {
    pub fn kind(&self) -> &'static str {
        match self {
            #[cfg(feature = "local-terminal")]
            AssetTransport::Local(_) => "local",
            AssetTransport::SshShell(_) => "ssh",
            #[cfg(test)]
            AssetTransport::Loopback(_) => "loopback",
        }
    }

    /// Queue input for the remote process, in call order
    pub async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "local-terminal")]
            AssetTransport::Local(t) => t.write(data).await,
            AssetTransport::SshShell(t) => t.write(data).await,
            #[cfg(test)]
            AssetTransport::Loopback(t) => t.write(data).await,
        }
    }

    /// Apply a window size change immediately
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "local-terminal")]
            AssetTransport::Local(t) => t.resize(cols, rows),
            AssetTransport::SshShell(t) => t.resize(cols, rows).await,
            #[cfg(test)]
            AssetTransport::Loopback(t) => t.resize(cols, rows),
        }
    }

    /// Tear the transport down; safe to call more than once
    pub async fn close(&self) {
        match self {
            #[cfg(feature = "local-terminal")]
            AssetTransport::Local(t) => t.close().await,
            AssetTransport::SshShell(t) => t.close().await,
            #[cfg(test)]
            AssetTransport::Loopback(t) => t.close(),
        }
    }
}

/// A transport plus its output queue
pub type OpenedTransport = (AssetTransport, mpsc::Receiver<TransportEvent>);

/// Opens terminal transports for assets
#[async_trait]
pub trait TransportOpener: Send + Sync {
    async fn open(&self, asset: &Asset, cols: u16, rows: u16)
        -> Result<OpenedTransport, TransportError>;
}

/// Production opener: local PTY or an SSH shell on the pooled connection
pub struct AssetTransportOpener {
    pool: Arc<ConnectionPool>,
    local_shell: LocalShellConfig,
    output_capacity: usize,
}

impl AssetTransportOpener {
    pub fn new(
        pool: Arc<ConnectionPool>,
        local_shell: LocalShellConfig,
        output_capacity: usize,
    ) -> Self {
        Self {
            pool,
            local_shell,
            output_capacity: output_capacity.max(1),
        }
    }
}

#[async_trait]
impl TransportOpener for AssetTransportOpener {
    async fn open(
        &self,
        asset: &Asset,
        cols: u16,
        rows: u16,
    ) -> Result<OpenedTransport, TransportError> {
        match &asset.target {
            AssetTarget::Local { shell } => {
                let shell = merge_shell(&self.local_shell, shell.as_ref());
                open_local(&shell, cols, rows, self.output_capacity)
            }
            AssetTarget::Ssh(_) => {
                info!("Opening SSH shell on asset {}", asset.id);
                let (shell, rx) =
                    SshShell::open(&self.pool, &asset.id, cols, rows, self.output_capacity).await?;
                Ok((AssetTransport::SshShell(shell), rx))
            }
        }
    }
}

/// Asset-level shell settings win over the engine default, field by field
fn merge_shell(base: &LocalShellConfig, asset: Option<&LocalShellConfig>) -> LocalShellConfig {
    let Some(asset) = asset else {
        return base.clone();
    };
    let mut merged = base.clone();
    if asset.program.is_some() {
        merged.program = asset.program.clone();
        merged.args = asset.args.clone();
    } else if !asset.args.is_empty() {
        merged.args = asset.args.clone();
    }
    if asset.cwd.is_some() {
        merged.cwd = asset.cwd.clone();
    }
    merged
        .env
        .extend(asset.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(feature = "local-terminal")]
fn open_local(
    shell: &LocalShellConfig,
    cols: u16,
    rows: u16,
    capacity: usize,
) -> Result<OpenedTransport, TransportError> {
    let (pty, rx) = local::LocalPty::spawn(shell, cols, rows, capacity)?;
    Ok((AssetTransport::Local(pty), rx))
}

#[cfg(not(feature = "local-terminal"))]
fn open_local(
    _shell: &LocalShellConfig,
    _cols: u16,
    _rows: u16,
    _capacity: usize,
) -> Result<OpenedTransport, TransportError> {
    Err(TransportError::Unsupported(
        "local terminals are disabled in this build".into(),
    ))
}

/// Byte stream a tunnel relays over
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Opens forwarding streams to `host:port` on behalf of `originator`
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TransportError>;
}
