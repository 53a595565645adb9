//! Remote Port Forwarding
//!
//! Forwards connections from a remote port back to a local host:port through SSH.
//! Example: remote server:9000 -> local:3000 (expose a local service to the remote)
//!
//! ## Architecture
//!
//! Remote forwarding needs coordination between:
//! 1. The tunnel (sends `tcpip-forward` through the `HandleController`)
//! 2. The SSH server (listens on the remote port)
//! 3. The `ClientHandler` callback (receives `forwarded-tcpip` channels)
//!
//! Each pooled connection owns a [`RemoteForwardRouter`] mapping
//! (address, port) to the local target, which the handler consults for every
//! forwarded channel of that connection.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::relay::{relay, RelayOptions, TrafficCounters};
use super::TunnelError;
use crate::ssh::HandleController;

/// Upper bound for connecting to the local target of a forwarded connection
const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a forwarded connection goes, plus the owning tunnel's bookkeeping
#[derive(Debug, Clone)]
pub struct RemoteRoute {
    pub tunnel_id: String,
    pub local_host: String,
    pub local_port: u16,
    pub counters: Arc<TrafficCounters>,
    pub relay: RelayOptions,
    /// Fires when the tunnel stops; relayed connections close with it
    pub cancel: CancellationToken,
}

/// Per-connection table of active remote forwards
#[derive(Debug, Default)]
pub struct RemoteForwardRouter {
    routes: DashMap<(String, u32), RemoteRoute>,
}

impl RemoteForwardRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: &str, port: u32, route: RemoteRoute) {
        debug!(
            "Registered remote forward {}:{} -> {}:{}",
            address, port, route.local_host, route.local_port
        );
        self.routes.insert((address.to_string(), port), route);
    }

    pub fn unregister(&self, address: &str, port: u32) {
        if self.routes.remove(&(address.to_string(), port)).is_some() {
            debug!("Unregistered remote forward {}:{}", address, port);
        }
    }

    /// Exact (address, port) first; servers may report the bound address
    /// differently (`localhost` vs `127.0.0.1`), so fall back to the port.
    pub fn lookup(&self, address: &str, port: u32) -> Option<RemoteRoute> {
        if let Some(route) = self.routes.get(&(address.to_string(), port)) {
            return Some(route.value().clone());
        }
        self.routes
            .iter()
            .find(|entry| entry.key().1 == port)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Ask the server to listen on `address:port` and route what arrives to
/// `route`. Returns the port actually bound (differs when `port` is 0).
///
/// The forward is cancelled and unregistered once `route.cancel` fires.
pub(crate) async fn start_remote_forward(
    controller: HandleController,
    router: Arc<RemoteForwardRouter>,
    address: String,
    port: u16,
    route: RemoteRoute,
) -> Result<u16, TunnelError> {
    info!(
        "Requesting remote port forward {}:{} -> {}:{}",
        address, port, route.local_host, route.local_port
    );

    // Register before asking: the server may open a channel as soon as it
    // has bound the port.
    router.register(&address, port as u32, route.clone());

    let bound = match controller.tcpip_forward(&address, port as u32).await {
        Ok(bound) => bound,
        Err(e) => {
            router.unregister(&address, port as u32);
            return Err(TunnelError::Resource(format!(
                "Server refused to listen on {}:{}: {}",
                address, port, e
            )));
        }
    };
    // Servers reply 0 when the requested port was honoured
    let bound = if bound == 0 { port as u32 } else { bound };
    if bound != port as u32 {
        router.register(&address, bound, route.clone());
        router.unregister(&address, port as u32);
    }

    info!(
        "Remote forward established on {}:{} (tunnel {})",
        address, bound, route.tunnel_id
    );

    let cancel = route.cancel.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        router.unregister(&address, bound);
        if let Err(e) = controller.cancel_tcpip_forward(&address, bound).await {
            debug!("cancel-tcpip-forward {}:{} failed: {}", address, bound, e);
        }
        info!("Remote forward on {}:{} stopped", address, bound);
    });

    Ok(bound as u16)
}

/// Relay one `forwarded-tcpip` channel to the route's local target
pub async fn handle_forwarded_connection(channel: Channel<Msg>, route: RemoteRoute) {
    if route.cancel.is_cancelled() {
        let _ = channel.close().await;
        return;
    }

    let _guard = route.counters.open_connection();
    let target = format!("{}:{}", route.local_host, route.local_port);

    let local = match tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(&target)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Forwarded connection: cannot reach {}: {}", target, e);
            let _ = channel.close().await;
            return;
        }
        Err(_) => {
            warn!("Forwarded connection: connect to {} timed out", target);
            let _ = channel.close().await;
            return;
        }
    };
    if let Err(e) = local.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    debug!("Bridging forwarded connection to {}", target);
    let end = relay(
        local,
        channel.into_stream(),
        route.counters.clone(),
        route.relay,
        route.cancel.clone(),
    )
    .await;
    debug!("Forwarded connection to {} closed ({:?})", target, end);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(tunnel_id: &str, local_port: u16) -> RemoteRoute {
        RemoteRoute {
            tunnel_id: tunnel_id.into(),
            local_host: "127.0.0.1".into(),
            local_port,
            counters: Arc::new(TrafficCounters::new()),
            relay: RelayOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_router_exact_lookup() {
        let router = RemoteForwardRouter::new();
        router.register("0.0.0.0", 9000, route("t1", 3000));

        let found = router.lookup("0.0.0.0", 9000).unwrap();
        assert_eq!(found.tunnel_id, "t1");
        assert_eq!(found.local_port, 3000);

        router.unregister("0.0.0.0", 9000);
        assert!(router.lookup("0.0.0.0", 9000).is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn test_router_falls_back_to_port() {
        let router = RemoteForwardRouter::new();
        router.register("localhost", 9100, route("t2", 8080));

        let found = router.lookup("127.0.0.1", 9100).unwrap();
        assert_eq!(found.tunnel_id, "t2");
        assert!(router.lookup("127.0.0.1", 9101).is_none());
    }
}
