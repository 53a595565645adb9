//! OxideRemote - remote access engine
//!
//! Multiplexed terminals over WebSocket (local PTY or SSH shell), pooled
//! SSH connections shared by every consumer of an asset, and local, remote
//! and SOCKS port-forwarding tunnels.
//!
//! [`Engine`] wires the pieces together:
//!
//! ```text
//!  WebSocket ──▶ bridge::TerminalServer ──▶ session::TerminalSession ──▶ transport::AssetTransport
//!                        │                                                   │
//!                 session::SessionRegistry                          ssh::ConnectionPool
//!                                                                            ▲
//!                                        forwarding::TunnelManager ──────────┘
//! ```

pub mod asset;
pub mod bridge;
pub mod config;
pub mod forwarding;
pub mod session;
pub mod ssh;
pub mod transport;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use asset::AssetStore;
use bridge::{BridgeError, TerminalServer};
use config::EngineConfig;
use forwarding::{EventEmitter, TunnelManager};
use session::SessionRegistry;
use ssh::ConnectionPool;
use transport::AssetTransportOpener;

/// Initialize logging. `RUST_LOG` wins over `filter`; both unset means `info`.
/// Safe to call more than once.
pub fn init_logging(filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine already started")]
    AlreadyStarted,

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Engine {
    config: EngineConfig,
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionRegistry>,
    tunnels: Arc<TunnelManager>,
    server: Arc<TerminalServer>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        assets: Arc<dyn AssetStore>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::with_ssh(config.pool.clone(), assets.clone()));
        let sessions = Arc::new(SessionRegistry::new(config.session.reconnect_grace()));
        let tunnels = Arc::new(TunnelManager::new(pool.clone(), emitter, &config.tunnel));
        let opener = Arc::new(AssetTransportOpener::new(
            pool.clone(),
            config.local_shell.clone(),
            config.session.output_queue_capacity,
        ));
        let server = Arc::new(TerminalServer::new(
            config.ws.clone(),
            config.session.clone(),
            assets,
            sessions.clone(),
            opener,
        ));

        Self {
            config,
            pool,
            sessions,
            tunnels,
            server,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the terminal listener and start the background workers.
    /// Returns the address terminals connect to.
    pub async fn start(&self) -> Result<SocketAddr, EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        let listener = match self.server.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;

        let sweep_every = Duration::from_secs(self.config.session.sweep_interval_secs.max(1));
        let mut tasks = self.tasks.lock();
        tasks.push(self.pool.spawn_maintenance(self.cancel.child_token()));
        tasks.push(
            self.sessions
                .spawn_sweeper(sweep_every, self.cancel.child_token()),
        );
        tasks.push(tokio::spawn(
            self.server.clone().serve(listener, self.cancel.child_token()),
        ));

        info!("Engine started, terminals at ws://{}/terminal/{{asset_id}}", addr);
        Ok(addr)
    }

    /// Stop workers, tunnels, sessions and pooled connections
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.cancel.cancel();
        self.tunnels.stop_all().await;
        self.sessions.close_all().await;
        self.pool.shutdown();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Asset, MemoryAssetStore};
    use crate::forwarding::{NoopEmitter, TunnelSpec};
    use futures_util::StreamExt;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    fn engine(assets: Vec<Asset>) -> Engine {
        Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryAssetStore::with_assets(assets)),
            Arc::new(NoopEmitter),
        )
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging(Some("oxide_remote=debug"));
        init_logging(None);
    }

    #[tokio::test]
    async fn test_start_serves_terminals_and_shuts_down() {
        let engine = engine(vec![]);
        let addr = engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(EngineError::AlreadyStarted)));

        let (mut client, _) = connect_async(format!("ws://{}/terminal/missing", addr))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            Message::Text(text) => assert!(text.contains(r#""kind":"not_found""#)),
            other => panic!("unexpected frame {:?}", other),
        }

        engine.shutdown().await;
        assert!(engine.sessions().is_empty());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_tunnel_bookkeeping() {
        let engine = engine(vec![]);
        let spec = engine
            .tunnels()
            .create(TunnelSpec::dynamic("db", "127.0.0.1", 0))
            .await
            .unwrap();
        engine.shutdown().await;

        // Pool is closed: starting now fails with a transport error
        assert!(engine.tunnels().start(&spec.id).await.is_err());
        assert_eq!(engine.pool().stats().connections.len(), 0);
    }
}
