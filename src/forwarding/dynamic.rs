//! Dynamic Port Forwarding (SOCKS proxy)
//!
//! Binds a local listener speaking SOCKS4, SOCKS4a and SOCKS5. Each client
//! names its destination in the handshake, which becomes a direct-tcpip
//! channel through SSH.
//!
//! Supported:
//! - SOCKS5 NO AUTH method, CONNECT command, IPv4 / domain / IPv6 addresses
//! - SOCKS4 CONNECT (IPv4) and the SOCKS4a domain extension

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::relay::{relay, RelayOptions, TrafficCounters};
use crate::transport::{StreamOpener, TransportError};

/// A client must finish its request within this (or the idle timeout, if shorter)
const SOCKS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CONN_REFUSED: u8 = 0x05;
    pub const REP_TTL_EXPIRED: u8 = 0x06;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS4 protocol constants
mod socks4 {
    pub const VERSION: u8 = 0x04;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const REPLY_VERSION: u8 = 0x00;
    pub const GRANTED: u8 = 0x5A;
    pub const REJECTED: u8 = 0x5B;
    /// Longest user id / domain accepted in a SOCKS4(a) request
    pub const MAX_FIELD: usize = 255;
}

#[derive(Debug, Error)]
pub(crate) enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),
    #[error("Client offers no acceptable auth method")]
    NoAcceptableAuth,
    #[error("Unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),
    #[error("Unsupported address type: {0}")]
    UnsupportedAddress(u8),
    #[error("Malformed request: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocksVersion {
    V4,
    V5,
}

/// A parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SocksRequest {
    pub version: SocksVersion,
    pub host: String,
    pub port: u16,
}

/// Run the server side of the handshake up to (not including) the reply.
///
/// Protocol violations that have a wire-level answer (unsupported command or
/// address type, no acceptable auth) are answered before returning the error.
pub(crate) async fn read_request<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_u8().await? {
        socks5::VERSION => read_socks5_request(stream).await,
        socks4::VERSION => read_socks4_request(stream).await,
        other => Err(SocksError::UnsupportedVersion(other)),
    }
}

async fn read_socks5_request<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Phase 1: method negotiation
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableAuth);
    }
    stream.write_all(&[socks5::VERSION, socks5::AUTH_NONE]).await?;

    // Phase 2: request
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _reserved, atyp] = header;

    if version != socks5::VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if cmd != socks5::CMD_CONNECT {
        send_socks5_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    let host = match atyp {
        socks5::ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        socks5::ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| SocksError::Malformed("domain is not UTF-8"))?
        }
        socks5::ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        other => {
            send_socks5_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(SocksError::UnsupportedAddress(other));
        }
    };
    let port = stream.read_u16().await?;

    Ok(SocksRequest {
        version: SocksVersion::V5,
        host,
        port,
    })
}

async fn read_socks4_request<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cmd = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    // User id is ignored
    read_nul_terminated(stream).await?;

    if cmd != socks4::CMD_CONNECT {
        send_socks4_reply(stream, false).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    // SOCKS4a: 0.0.0.x with x != 0 means a domain follows the user id
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        let domain = read_nul_terminated(stream).await?;
        String::from_utf8(domain).map_err(|_| SocksError::Malformed("domain is not UTF-8"))?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    Ok(SocksRequest {
        version: SocksVersion::V4,
        host,
        port,
    })
}

async fn read_nul_terminated<S>(stream: &mut S) -> Result<Vec<u8>, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() == socks4::MAX_FIELD {
            return Err(SocksError::Malformed("field too long"));
        }
        out.push(byte);
    }
}

async fn send_socks5_reply<S>(stream: &mut S, status: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // VER REP RSV ATYP=IPv4 BND.ADDR=0.0.0.0 BND.PORT=0
    stream
        .write_all(&[socks5::VERSION, status, 0x00, socks5::ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

async fn send_socks4_reply<S>(stream: &mut S, granted: bool) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let status = if granted {
        socks4::GRANTED
    } else {
        socks4::REJECTED
    };
    stream
        .write_all(&[socks4::REPLY_VERSION, status, 0, 0, 0, 0, 0, 0])
        .await
}

/// Reply to a parsed request with the outcome of opening the channel
pub(crate) async fn send_reply<S>(
    stream: &mut S,
    version: SocksVersion,
    outcome: Result<(), &TransportError>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V4 => send_socks4_reply(stream, outcome.is_ok()).await,
        SocksVersion::V5 => {
            let status = match outcome {
                Ok(()) => socks5::REP_SUCCESS,
                Err(TransportError::ConnectionRefused(_)) => socks5::REP_CONN_REFUSED,
                Err(TransportError::HostUnreachable(_)) => socks5::REP_HOST_UNREACHABLE,
                Err(TransportError::Timeout(_)) => socks5::REP_TTL_EXPIRED,
                Err(TransportError::Closed) => socks5::REP_NETWORK_UNREACHABLE,
                Err(_) => socks5::REP_GENERAL_FAILURE,
            };
            send_socks5_reply(stream, status).await
        }
    }
}

/// Accept loop of a running dynamic forward
pub(crate) fn spawn_dynamic_forward(
    listener: TcpListener,
    opener: Arc<dyn StreamOpener>,
    counters: Arc<TrafficCounters>,
    opts: RelayOptions,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bound = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!("SOCKS proxy listening on {}", bound);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("Accept error on {}: {}", bound, e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    tokio::spawn(socks_connection(
                        stream,
                        peer,
                        opener.clone(),
                        counters.clone(),
                        opts,
                        cancel.child_token(),
                    ));
                }
            }
        }

        info!("SOCKS proxy on {} stopped", bound);
    })
}

async fn socks_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    opener: Arc<dyn StreamOpener>,
    counters: Arc<TrafficCounters>,
    opts: RelayOptions,
    cancel: CancellationToken,
) {
    let _guard = counters.open_connection();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let deadline = opts.idle_timeout.min(SOCKS_HANDSHAKE_TIMEOUT);
    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        request = tokio::time::timeout(deadline, read_request(&mut stream)) => request,
    };
    let request = match handshake {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!("SOCKS handshake from {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("SOCKS handshake from {} timed out after {:?}", peer, deadline);
            return;
        }
    };
    debug!(
        "SOCKS{} {} -> {}:{}",
        if request.version == SocksVersion::V4 { "4" } else { "5" },
        peer,
        request.host,
        request.port
    );

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = opener.open_stream(&request.host, request.port, peer) => opened,
    };
    let remote = match opened {
        Ok(remote) => remote,
        Err(e) => {
            warn!(
                "SOCKS: cannot open channel to {}:{}: {}",
                request.host, request.port, e
            );
            let _ = send_reply(&mut stream, request.version, Err(&e)).await;
            return;
        }
    };
    if send_reply(&mut stream, request.version, Ok(())).await.is_err() {
        return;
    }

    let end = relay(stream, remote, counters, opts, cancel).await;
    debug!("SOCKS connection from {} closed ({:?})", peer, end);
}
