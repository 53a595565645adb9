//! SSH Connection Pool
//!
//! One multiplexed SSH connection per remote asset, shared by every terminal
//! and tunnel of that asset.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConnectionPool                                              │
//! │  slots: asset_id -> Dialing(shared future) | Ready(conn)     │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  PooledConnection                                       │  │
//! │  │  ├── controller: HandleController                      │  │
//! │  │  ├── ref_count: AtomicU32                               │  │
//! │  │  ├── health: Alive | Dead  (+ CancellationToken)        │  │
//! │  │  └── forwards: RemoteForwardRouter                      │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          │  Arc<PooledConnection>
//!    ┌─────┴─────┬─────────────┐
//!    ▼           ▼             ▼
//! Terminal   Terminal      Tunnel
//! ```
//!
//! # Lifecycle
//!
//! - First `get` for an asset starts a dial; concurrent callers await the
//!   same shared future (single flight). A failed dial fails every waiter
//!   and is not retried.
//! - Every successful `get` adds a reference; `release` drops one.
//! - A watcher task pings the connection. An I/O failure, repeated missed
//!   pings, or the owner task exiting marks it Dead. Dead is terminal and
//!   fires the connection's cancellation token so dependents fail fast.
//! - The sweep closes unreferenced connections idle past the TTL and drops
//!   unreferenced Dead ones. A Dead connection is replaced on the next `get`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{connect, DialOptions};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use crate::asset::{Asset, AssetStore, AssetTarget};
use crate::config::PoolConfig;
use crate::forwarding::remote::RemoteForwardRouter;

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Asset {0} is not an SSH asset")]
    NotSsh(String),

    #[error("Asset store error: {0}")]
    Store(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection limit reached: {current}/{max}")]
    LimitReached { current: usize, max: usize },

    #[error("Connection pool is shut down")]
    Closed,
}

impl From<SshError> for PoolError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::ConnectionRefused(m) => PoolError::ConnectionRefused(m),
            SshError::HostUnreachable(m) => PoolError::HostUnreachable(m),
            SshError::AuthenticationFailed(m) => PoolError::AuthFailed(m),
            SshError::KeyError(m) | SshError::CertificateError(m) => PoolError::AuthFailed(m),
            SshError::Timeout(m) => PoolError::Timeout(m),
            other => PoolError::Connect(other.to_string()),
        }
    }
}

/// Opens a ready-to-use connection for an asset
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        asset: &Asset,
        forwards: Arc<RemoteForwardRouter>,
    ) -> Result<HandleController, SshError>;
}

/// Production dialer: TCP + SSH handshake + auth, then a handle owner task
pub struct SshDialer {
    opts: DialOptions,
}

impl SshDialer {
    pub fn new(opts: DialOptions) -> Self {
        Self { opts }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(DialOptions {
            connect_timeout: config.connect_timeout(),
            ssh_keepalive: Duration::from_secs(config.ssh_keepalive_secs),
        })
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        asset: &Asset,
        forwards: Arc<RemoteForwardRouter>,
    ) -> Result<HandleController, SshError> {
        let AssetTarget::Ssh(config) = &asset.target else {
            return Err(SshError::ConnectionFailed(format!(
                "asset {} is not an SSH asset",
                asset.id
            )));
        };
        let conn = connect(config, forwards, &self.opts).await?;
        Ok(spawn_handle_owner_task(
            conn.handle,
            conn.jump_handles,
            asset.id.clone(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Alive,
    Dead,
}

/// A shared SSH connection and its bookkeeping
pub struct PooledConnection {
    asset_id: String,
    controller: HandleController,
    ref_count: AtomicU32,
    /// Unix millis
    last_used: AtomicI64,
    alive: AtomicBool,
    dead_reason: Mutex<Option<String>>,
    dead: CancellationToken,
    forwards: Arc<RemoteForwardRouter>,
}

impl PooledConnection {
    fn new(
        asset_id: String,
        controller: HandleController,
        forwards: Arc<RemoteForwardRouter>,
    ) -> Self {
        Self {
            asset_id,
            controller,
            ref_count: AtomicU32::new(0),
            last_used: AtomicI64::new(Utc::now().timestamp_millis()),
            alive: AtomicBool::new(true),
            dead_reason: Mutex::new(None),
            dead: CancellationToken::new(),
            forwards,
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn controller(&self) -> &HandleController {
        &self.controller
    }

    pub fn forwards(&self) -> &Arc<RemoteForwardRouter> {
        &self.forwards
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> ConnectionHealth {
        if self.alive.load(Ordering::SeqCst) {
            ConnectionHealth::Alive
        } else {
            ConnectionHealth::Dead
        }
    }

    pub fn is_alive(&self) -> bool {
        self.health() == ConnectionHealth::Alive
    }

    pub fn dead_reason(&self) -> Option<String> {
        self.dead_reason.lock().clone()
    }

    /// Resolves once the connection is Dead
    pub async fn closed(&self) {
        self.dead.cancelled().await
    }

    /// Token cancelled when the connection dies, for `select!` in dependents
    pub fn dead_token(&self) -> CancellationToken {
        self.dead.clone()
    }

    pub fn touch(&self) {
        self.last_used
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let idle_ms = Utc::now().timestamp_millis() - self.last_used.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    fn acquire(&self) -> u32 {
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.touch();
        debug!("Connection {} ref count increased to {}", self.asset_id, count);
        count
    }

    fn release(&self) -> u32 {
        let prev = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        self.touch();
        match prev {
            Ok(prev) => {
                debug!("Connection {} ref count decreased to {}", self.asset_id, prev - 1);
                prev - 1
            }
            Err(_) => {
                warn!("Connection {} ref count already 0, not decrementing", self.asset_id);
                0
            }
        }
    }

    /// Alive -> Dead, once. Fails every dependent and tears the transport down.
    pub(crate) fn mark_dead(&self, reason: &str) {
        if self
            .alive
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.dead_reason.lock() = Some(reason.to_string());
        warn!("Connection {} is dead: {}", self.asset_id, reason);
        self.dead.cancel();

        let controller = self.controller.clone();
        tokio::spawn(async move {
            controller.disconnect().await;
        });
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("asset_id", &self.asset_id)
            .field("ref_count", &self.ref_count())
            .field("health", &self.health())
            .finish()
    }
}

type DialFuture = Shared<BoxFuture<'static, Result<Arc<PooledConnection>, PoolError>>>;

enum PoolSlot {
    Dialing { generation: u64, fut: DialFuture },
    Ready(Arc<PooledConnection>),
}

/// Per-connection snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub asset_id: String,
    pub ref_count: u32,
    pub health: ConnectionHealth,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub connections: Vec<ConnectionStats>,
    pub dialing: usize,
}

pub struct ConnectionPool {
    config: PoolConfig,
    assets: Arc<dyn AssetStore>,
    dialer: Arc<dyn Dialer>,
    slots: Mutex<HashMap<String, PoolSlot>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, assets: Arc<dyn AssetStore>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            assets,
            dialer,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool with the production SSH dialer
    pub fn with_ssh(config: PoolConfig, assets: Arc<dyn AssetStore>) -> Self {
        let dialer = Arc::new(SshDialer::from_config(&config));
        Self::new(config, assets, dialer)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Shared connection for `asset_id`, dialing on first use.
    ///
    /// Adds one reference; hand the returned instance back to [`release`]
    /// exactly once.
    ///
    /// [`release`]: ConnectionPool::release
    pub async fn get(self: &Arc<Self>, asset_id: &str) -> Result<Arc<PooledConnection>, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let fut = {
            let mut slots = self.slots.lock();
            match slots.get(asset_id) {
                Some(PoolSlot::Ready(conn)) if conn.is_alive() => {
                    conn.acquire();
                    return Ok(conn.clone());
                }
                Some(PoolSlot::Dialing { fut, .. }) => {
                    debug!("Joining in-flight dial for asset {}", asset_id);
                    fut.clone()
                }
                _ => {
                    if let Some(PoolSlot::Ready(dead)) = slots.remove(asset_id) {
                        info!(
                            "Replacing dead connection for asset {} ({} holder(s) left)",
                            asset_id,
                            dead.ref_count()
                        );
                    }
                    if self.config.max_connections > 0 && slots.len() >= self.config.max_connections
                    {
                        return Err(PoolError::LimitReached {
                            current: slots.len(),
                            max: self.config.max_connections,
                        });
                    }

                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                    let fut = self.start_dial(asset_id.to_string(), generation);
                    slots.insert(
                        asset_id.to_string(),
                        PoolSlot::Dialing {
                            generation,
                            fut: fut.clone(),
                        },
                    );
                    fut
                }
            }
        };

        let conn = fut.await?;
        conn.acquire();
        Ok(conn)
    }

    /// Spawn the dial so it completes even if every waiter goes away
    fn start_dial(self: &Arc<Self>, asset_id: String, generation: u64) -> DialFuture {
        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = pool.dial(&asset_id).await;

            let mut slots = pool.slots.lock();
            let current = matches!(
                slots.get(&asset_id),
                Some(PoolSlot::Dialing { generation: g, .. }) if *g == generation
            );
            let closed = pool.closed.load(Ordering::SeqCst);
            match result {
                Ok(conn) if current && !closed => {
                    slots.insert(asset_id.clone(), PoolSlot::Ready(conn.clone()));
                    drop(slots);
                    pool.spawn_watcher(conn.clone());
                    Ok(conn)
                }
                Ok(conn) => {
                    // The pool no longer tracks this connection
                    drop(slots);
                    conn.mark_dead("dial superseded");
                    if closed {
                        Err(PoolError::Closed)
                    } else {
                        Err(PoolError::Connect(format!(
                            "dial for asset {} was superseded",
                            asset_id
                        )))
                    }
                }
                Err(e) => {
                    if current {
                        slots.remove(&asset_id);
                    }
                    Err(e)
                }
            }
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(PoolError::Connect(format!("dial task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    async fn dial(&self, asset_id: &str) -> Result<Arc<PooledConnection>, PoolError> {
        let asset = self
            .assets
            .get_asset(asset_id)
            .await
            .map_err(|e| PoolError::Store(e.to_string()))?
            .ok_or_else(|| PoolError::AssetNotFound(asset_id.to_string()))?;
        if asset.is_local() {
            return Err(PoolError::NotSsh(asset_id.to_string()));
        }

        info!("Dialing SSH connection for asset {}", asset_id);
        let forwards = Arc::new(RemoteForwardRouter::new());
        let controller = self
            .dialer
            .dial(&asset, forwards.clone())
            .await
            .map_err(|e| {
                error!("Dial for asset {} failed: {}", asset_id, e);
                PoolError::from(e)
            })?;

        info!("SSH connection for asset {} established", asset_id);
        Ok(Arc::new(PooledConnection::new(
            asset_id.to_string(),
            controller,
            forwards,
        )))
    }

    /// Drop one reference taken by `get`.
    ///
    /// Takes the instance rather than the asset id, so a holder of a replaced
    /// connection never touches its successor's count.
    pub fn release(&self, conn: &Arc<PooledConnection>) {
        conn.release();
    }

    /// Keepalive plus disconnect watch for one connection
    fn spawn_watcher(&self, conn: Arc<PooledConnection>) {
        let interval = Duration::from_secs(self.config.keepalive_interval_secs.max(1));
        let timeout = Duration::from_secs(self.config.keepalive_timeout_secs.max(1));
        let max_failures = self.config.keepalive_max_failures.max(1);

        tokio::spawn(async move {
            let mut disconnect_rx = conn.controller.subscribe_disconnect();
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            let mut failures = 0u32;

            loop {
                tokio::select! {
                    _ = conn.dead.cancelled() => break,
                    _ = disconnect_rx.recv() => {
                        conn.mark_dead("SSH connection closed");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = tokio::time::timeout(timeout, conn.controller.ping())
                            .await
                            .unwrap_or(PingResult::Timeout);
                        match result {
                            PingResult::Ok => failures = 0,
                            PingResult::IoError => {
                                conn.mark_dead("keepalive I/O error");
                                break;
                            }
                            PingResult::Timeout => {
                                failures += 1;
                                warn!(
                                    "Connection {} keepalive timeout ({}/{})",
                                    conn.asset_id, failures, max_failures
                                );
                                if failures >= max_failures {
                                    conn.mark_dead("keepalive timed out");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            debug!("Keepalive watcher for {} stopped", conn.asset_id);
        });
    }

    /// Close unreferenced connections idle past the TTL and drop unreferenced
    /// Dead ones. Returns the asset ids removed.
    pub fn sweep(&self) -> Vec<String> {
        let ttl = self.config.idle_ttl();
        let evicted: Vec<Arc<PooledConnection>> = {
            let mut slots = self.slots.lock();
            let ids: Vec<String> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    PoolSlot::Ready(conn)
                        if conn.ref_count() == 0 && (!conn.is_alive() || conn.idle_for() >= ttl) =>
                    {
                        Some(id.clone())
                    }
                    _ => None,
                })
                .collect();
            ids.iter()
                .filter_map(|id| match slots.remove(id) {
                    Some(PoolSlot::Ready(conn)) => Some(conn),
                    _ => None,
                })
                .collect()
        };

        for conn in &evicted {
            if conn.is_alive() {
                info!("Closing idle connection for asset {}", conn.asset_id);
                conn.mark_dead("idle timeout");
            } else {
                debug!("Dropping dead connection for asset {}", conn.asset_id);
            }
        }
        evicted.iter().map(|c| c.asset_id.clone()).collect()
    }

    /// Periodic sweep until `cancel` fires
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let every = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.sweep();
                        if !evicted.is_empty() {
                            debug!("Pool sweep evicted {:?}", evicted);
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock();
        let mut stats = PoolStats::default();
        for (id, slot) in slots.iter() {
            match slot {
                PoolSlot::Dialing { .. } => stats.dialing += 1,
                PoolSlot::Ready(conn) => stats.connections.push(ConnectionStats {
                    asset_id: id.clone(),
                    ref_count: conn.ref_count(),
                    health: conn.health(),
                    idle_secs: conn.idle_for().as_secs(),
                }),
            }
        }
        stats
    }

    /// Close every connection and refuse further `get`s
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PoolSlot> = self.slots.lock().drain().map(|(_, s)| s).collect();
        info!("Shutting down connection pool ({} slot(s))", drained.len());
        for slot in drained {
            if let PoolSlot::Ready(conn) = slot {
                conn.mark_dead("pool shut down");
            }
        }
    }
}
