//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: forward local:8080 -> db.internal:3306

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::relay::{relay, RelayOptions, TrafficCounters};
use super::TunnelError;
use crate::transport::StreamOpener;

/// Bind a tunnel listener, mapping OS errors to something a user can act on
pub(crate) async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, TunnelError> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr).await.map_err(|e| {
        TunnelError::Resource(match e.kind() {
            io::ErrorKind::AddrInUse => format!(
                "Port already in use: {}. Another application may be using this port.",
                addr
            ),
            io::ErrorKind::PermissionDenied => format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                addr
            ),
            io::ErrorKind::AddrNotAvailable => format!(
                "Address not available: {}. The specified address is not valid on this system.",
                addr
            ),
            _ => format!("Failed to bind to {}: {}", addr, e),
        })
    })
}

/// Accept loop of a running local forward.
///
/// Every accepted connection gets its own direct-tcpip stream to
/// `remote_host:remote_port` and a relay. Cancelling `cancel` stops the
/// accept loop and force-closes every relayed connection.
pub(crate) fn spawn_local_forward(
    listener: TcpListener,
    opener: Arc<dyn StreamOpener>,
    remote_host: String,
    remote_port: u16,
    counters: Arc<TrafficCounters>,
    opts: RelayOptions,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bound = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(
            "Local port forward listening on {} -> {}:{}",
            bound, remote_host, remote_port
        );

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
                    debug!("Accepted {} on local forward {}", peer, bound);
                    tokio::spawn(forward_connection(
                        stream,
                        peer,
                        opener.clone(),
                        remote_host.clone(),
                        remote_port,
                        counters.clone(),
                        opts,
                        cancel.child_token(),
                    ));
                }
            }
        }

        // Dropping the listener here is what stops new connections
        info!("Local port forward on {} stopped", bound);
    })
}

#[allow(clippy::too_many_arguments)]
async fn forward_connection(
    stream: TcpStream,
    peer: SocketAddr,
    opener: Arc<dyn StreamOpener>,
    remote_host: String,
    remote_port: u16,
    counters: Arc<TrafficCounters>,
    opts: RelayOptions,
    cancel: CancellationToken,
) {
    let _guard = counters.open_connection();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let remote = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = opener.open_stream(&remote_host, remote_port, peer) => opened,
    };
    let remote = match remote {
        Ok(remote) => remote,
        Err(e) => {
            warn!(
                "Cannot open channel to {}:{} for {}: {}",
                remote_host, remote_port, peer, e
            );
            return;
        }
    };

    let end = relay(stream, remote, counters, opts, cancel).await;
    debug!("Forwarded connection from {} closed ({:?})", peer, end);
}
