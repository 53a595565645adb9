//! Tunnel Manager
//!
//! Owns every [`TunnelSpec`] and the runtime state of running tunnels.
//! Each running tunnel holds one reference on its asset's pooled SSH
//! connection, a cancellation token shared by its accept loop and relays,
//! and a watcher that moves it to `Error` when the connection goes Dead.
//!
//! Persistence is external: specs come in through `create`/`restore` and go
//! out through `list`/`get`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dynamic::spawn_dynamic_forward;
use super::events::{EventEmitter, TunnelEvent};
use super::local::{bind_listener, spawn_local_forward};
use super::relay::{RelayOptions, TrafficCounters, TunnelStats};
use super::remote::{start_remote_forward, RemoteRoute};
use super::TunnelError;
use crate::config::TunnelConfig;
use crate::ssh::{ConnectionPool, PooledConnection};
use crate::transport::{DirectTcpip, StreamOpener};

/// How long `stop` waits for an accept loop to drop its listener
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Type of tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Local port forwarding (-L)
    Local,
    /// Remote port forwarding (-R)
    Remote,
    /// Dynamic SOCKS proxy (-D)
    Dynamic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

/// A tunnel definition plus its last known runtime state.
///
/// For `local` and `dynamic` tunnels `local_host:local_port` is the listener
/// on this machine. For `remote` tunnels it is the target that forwarded
/// connections are relayed to, and `remote_host:remote_port` is the listener
/// on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub id: String,
    pub asset_id: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub local_host: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub status: TunnelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stats: TunnelStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TunnelSpec {
    fn new(asset_id: impl Into<String>, tunnel_type: TunnelType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            asset_id: asset_id.into(),
            tunnel_type,
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            remote_host: None,
            remote_port: None,
            status: TunnelStatus::Stopped,
            error_message: None,
            stats: TunnelStats::default(),
            started_at: None,
            description: None,
        }
    }

    /// Listen on `local_host:local_port`, reach `remote_host:remote_port` from the server
    pub fn local(
        asset_id: impl Into<String>,
        local_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            remote_host: Some(remote_host.into()),
            remote_port: Some(remote_port),
            ..Self::new(asset_id, TunnelType::Local)
        }
    }

    /// Server listens on `remote_host:remote_port`, connections come back to `local_host:local_port`
    pub fn remote(
        asset_id: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            remote_host: Some(remote_host.into()),
            remote_port: Some(remote_port),
            ..Self::new(asset_id, TunnelType::Remote)
        }
    }

    /// SOCKS4/5 proxy on `local_host:local_port`
    pub fn dynamic(
        asset_id: impl Into<String>,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            description: Some("SOCKS Proxy".into()),
            ..Self::new(asset_id, TunnelType::Dynamic)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Check the type-specific shape
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.asset_id.trim().is_empty() {
            return Err(TunnelError::Validation("asset_id is required".into()));
        }
        if self.local_host.trim().is_empty() {
            return Err(TunnelError::Validation("local_host is required".into()));
        }

        match self.tunnel_type {
            TunnelType::Dynamic => {
                if self.remote_host.is_some() || self.remote_port.is_some() {
                    return Err(TunnelError::Validation(
                        "dynamic tunnels take no remote_host/remote_port".into(),
                    ));
                }
            }
            TunnelType::Local | TunnelType::Remote => {
                let has_host = self
                    .remote_host
                    .as_deref()
                    .is_some_and(|h| !h.trim().is_empty());
                if !has_host || self.remote_port.is_none() {
                    return Err(TunnelError::Validation(format!(
                        "{} tunnels require remote_host and remote_port",
                        self.type_name()
                    )));
                }
                if self.tunnel_type == TunnelType::Local && self.remote_port == Some(0) {
                    return Err(TunnelError::Validation(
                        "remote_port must be non-zero for local tunnels".into(),
                    ));
                }
                if self.tunnel_type == TunnelType::Remote && self.local_port == 0 {
                    return Err(TunnelError::Validation(
                        "local_port must be non-zero for remote tunnels".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        match self.tunnel_type {
            TunnelType::Local => "local",
            TunnelType::Remote => "remote",
            TunnelType::Dynamic => "dynamic",
        }
    }

    fn remote_target(&self) -> Result<(String, u16), TunnelError> {
        match (&self.remote_host, self.remote_port) {
            (Some(host), Some(port)) => Ok((host.clone(), port)),
            _ => Err(TunnelError::Validation(format!(
                "{} tunnels require remote_host and remote_port",
                self.type_name()
            ))),
        }
    }

    /// Back to a never-started state (used on create and restore)
    fn reset_runtime(&mut self) {
        self.status = TunnelStatus::Stopped;
        self.error_message = None;
        self.stats = TunnelStats::default();
        self.started_at = None;
    }
}

/// Edits for a stopped tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelUpdate {
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub description: Option<String>,
}

type OpenerFactory = Arc<dyn Fn(Arc<PooledConnection>) -> Arc<dyn StreamOpener> + Send + Sync>;

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    conn: Arc<PooledConnection>,
    task: Option<JoinHandle<()>>,
}

struct TunnelEntry {
    spec: TunnelSpec,
    /// Counters of the current (or last) run
    counters: Arc<TrafficCounters>,
    run: Option<ActiveRun>,
    starting: bool,
    /// Set by `stop` while a start is in flight; the start then backs out
    stop_requested: bool,
}

impl TunnelEntry {
    fn new(spec: TunnelSpec) -> Self {
        Self {
            spec,
            counters: Arc::new(TrafficCounters::new()),
            run: None,
            starting: false,
            stop_requested: false,
        }
    }

    fn snapshot(&self) -> TunnelSpec {
        let mut spec = self.spec.clone();
        spec.stats = self.counters.snapshot();
        spec
    }
}

struct Launched {
    run: ActiveRun,
    counters: Arc<TrafficCounters>,
    local_port: u16,
    remote_port: Option<u16>,
}

pub struct TunnelManager {
    pool: Arc<ConnectionPool>,
    emitter: Arc<dyn EventEmitter>,
    relay: RelayOptions,
    openers: OpenerFactory,
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
    runs: AtomicU64,
}

impl TunnelManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        emitter: Arc<dyn EventEmitter>,
        config: &TunnelConfig,
    ) -> Self {
        Self {
            pool,
            emitter,
            relay: RelayOptions::from(config),
            openers: Arc::new(|conn: Arc<PooledConnection>| {
                Arc::new(DirectTcpip::new(conn)) as Arc<dyn StreamOpener>
            }),
            tunnels: RwLock::new(HashMap::new()),
            runs: AtomicU64::new(0),
        }
    }

    /// Replace how forwarding streams are opened on a connection
    #[cfg(test)]
    pub(crate) fn with_stream_opener(mut self, openers: OpenerFactory) -> Self {
        self.openers = openers;
        self
    }

    /// Validate and record a new tunnel as Stopped
    pub async fn create(&self, mut spec: TunnelSpec) -> Result<TunnelSpec, TunnelError> {
        if spec.id.trim().is_empty() {
            spec.id = Uuid::new_v4().to_string();
        }
        spec.validate()?;
        spec.reset_runtime();

        {
            let mut tunnels = self.tunnels.write().await;
            if tunnels.contains_key(&spec.id) {
                return Err(TunnelError::Validation(format!(
                    "tunnel id {} already exists",
                    spec.id
                )));
            }
            tunnels.insert(spec.id.clone(), TunnelEntry::new(spec.clone()));
        }

        info!(
            "Created {} tunnel {} on asset {}",
            spec.type_name(),
            spec.id,
            spec.asset_id
        );
        self.emitter.emit(TunnelEvent::Created {
            tunnel_id: spec.id.clone(),
            asset_id: spec.asset_id.clone(),
        });
        Ok(spec)
    }

    /// Load externally persisted specs. Everything comes back Stopped;
    /// invalid or duplicate specs are skipped. Returns how many were loaded.
    pub async fn restore(&self, specs: Vec<TunnelSpec>) -> usize {
        let mut tunnels = self.tunnels.write().await;
        let mut loaded = 0;
        for mut spec in specs {
            if let Err(e) = spec.validate() {
                warn!("Skipping persisted tunnel {}: {}", spec.id, e);
                continue;
            }
            if tunnels.contains_key(&spec.id) {
                warn!("Skipping persisted tunnel {}: id already present", spec.id);
                continue;
            }
            spec.reset_runtime();
            tunnels.insert(spec.id.clone(), TunnelEntry::new(spec));
            loaded += 1;
        }
        info!("Restored {} tunnels", loaded);
        loaded
    }

    pub async fn get(&self, id: &str) -> Option<TunnelSpec> {
        self.tunnels.read().await.get(id).map(TunnelEntry::snapshot)
    }

    pub async fn list(&self) -> Vec<TunnelSpec> {
        let mut specs: Vec<TunnelSpec> = self
            .tunnels
            .read()
            .await
            .values()
            .map(TunnelEntry::snapshot)
            .collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    pub async fn list_by_asset(&self, asset_id: &str) -> Vec<TunnelSpec> {
        let mut specs: Vec<TunnelSpec> = self
            .tunnels
            .read()
            .await
            .values()
            .filter(|e| e.spec.asset_id == asset_id)
            .map(TunnelEntry::snapshot)
            .collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    pub async fn stats(&self, id: &str) -> Result<TunnelStats, TunnelError> {
        self.tunnels
            .read()
            .await
            .get(id)
            .map(|e| e.counters.snapshot())
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))
    }

    /// Start a Stopped (or Error) tunnel.
    ///
    /// A failed dial leaves the tunnel in Error; a failed bind leaves it
    /// Stopped. Either way the error is returned.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<TunnelSpec, TunnelError> {
        let spec = {
            let mut tunnels = self.tunnels.write().await;
            let entry = tunnels
                .get_mut(id)
                .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
            if entry.run.is_some() || entry.starting {
                return Err(TunnelError::AlreadyRunning(id.to_string()));
            }
            entry.starting = true;
            entry.stop_requested = false;
            entry.spec.clone()
        };

        let result = self.launch(&spec).await;

        let mut tunnels = self.tunnels.write().await;
        let Some(entry) = tunnels.get_mut(id) else {
            // Deleted while starting
            drop(tunnels);
            if let Ok(launched) = result {
                self.finish_run(launched.run).await;
            }
            return Err(TunnelError::NotFound(id.to_string()));
        };
        entry.starting = false;

        if std::mem::take(&mut entry.stop_requested) {
            drop(tunnels);
            info!("Tunnel {} was stopped while starting", id);
            if let Ok(launched) = result {
                self.finish_run(launched.run).await;
            }
            return Err(TunnelError::Stopped(id.to_string()));
        }

        match result {
            Ok(launched) => {
                entry.spec.status = TunnelStatus::Running;
                entry.spec.error_message = None;
                entry.spec.started_at = Some(Utc::now());
                entry.spec.local_port = launched.local_port;
                if launched.remote_port.is_some() {
                    entry.spec.remote_port = launched.remote_port;
                }
                entry.counters = launched.counters;
                self.spawn_watcher(
                    id.to_string(),
                    launched.run.id,
                    launched.run.conn.clone(),
                    launched.run.cancel.clone(),
                );
                entry.run = Some(launched.run);
                let spec = entry.snapshot();
                drop(tunnels);

                info!("Tunnel {} running", id);
                self.emit_status(&spec);
                Ok(spec)
            }
            Err(TunnelError::Transport(e)) => {
                entry.spec.status = TunnelStatus::Error;
                entry.spec.error_message = Some(e.to_string());
                entry.spec.started_at = None;
                let spec = entry.snapshot();
                drop(tunnels);

                warn!("Tunnel {} failed to start: {}", id, e);
                self.emit_status(&spec);
                Err(TunnelError::Transport(e))
            }
            Err(e) => {
                drop(tunnels);
                warn!("Tunnel {} not started: {}", id, e);
                Err(e)
            }
        }
    }

    async fn launch(&self, spec: &TunnelSpec) -> Result<Launched, TunnelError> {
        let conn = self.pool.get(&spec.asset_id).await?;
        let cancel = CancellationToken::new();
        let counters = Arc::new(TrafficCounters::new());

        let opened = self
            .open_listener(spec, &conn, counters.clone(), cancel.clone())
            .await;
        let (task, local_port, remote_port) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.pool.release(&conn);
                return Err(e);
            }
        };

        Ok(Launched {
            run: ActiveRun {
                id: self.runs.fetch_add(1, Ordering::Relaxed) + 1,
                cancel,
                conn,
                task,
            },
            counters,
            local_port,
            remote_port,
        })
    }

    async fn open_listener(
        &self,
        spec: &TunnelSpec,
        conn: &Arc<PooledConnection>,
        counters: Arc<TrafficCounters>,
        cancel: CancellationToken,
    ) -> Result<(Option<JoinHandle<()>>, u16, Option<u16>), TunnelError> {
        match spec.tunnel_type {
            TunnelType::Local => {
                let (remote_host, remote_port) = spec.remote_target()?;
                let listener = bind_listener(&spec.local_host, spec.local_port).await?;
                let port = listener
                    .local_addr()
                    .map(|a| a.port())
                    .unwrap_or(spec.local_port);
                let task = spawn_local_forward(
                    listener,
                    (self.openers)(conn.clone()),
                    remote_host,
                    remote_port,
                    counters,
                    self.relay,
                    cancel,
                );
                Ok((Some(task), port, None))
            }
            TunnelType::Dynamic => {
                let listener = bind_listener(&spec.local_host, spec.local_port).await?;
                let port = listener
                    .local_addr()
                    .map(|a| a.port())
                    .unwrap_or(spec.local_port);
                let task = spawn_dynamic_forward(
                    listener,
                    (self.openers)(conn.clone()),
                    counters,
                    self.relay,
                    cancel,
                );
                Ok((Some(task), port, None))
            }
            TunnelType::Remote => {
                let (remote_host, remote_port) = spec.remote_target()?;
                let route = RemoteRoute {
                    tunnel_id: spec.id.clone(),
                    local_host: spec.local_host.clone(),
                    local_port: spec.local_port,
                    counters,
                    relay: self.relay,
                    cancel,
                };
                let bound = start_remote_forward(
                    conn.controller().clone(),
                    conn.forwards().clone(),
                    remote_host,
                    remote_port,
                    route,
                )
                .await?;
                Ok((None, spec.local_port, Some(bound)))
            }
        }
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        tunnel_id: String,
        run_id: u64,
        conn: Arc<PooledConnection>,
        cancel: CancellationToken,
    ) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = conn.closed() => {
                    let reason = conn
                        .dead_reason()
                        .unwrap_or_else(|| "connection closed".to_string());
                    if let Some(manager) = manager.upgrade() {
                        manager
                            .fail_run(&tunnel_id, run_id, format!("SSH connection lost: {}", reason))
                            .await;
                    }
                }
            }
        });
    }

    async fn fail_run(&self, id: &str, run_id: u64, message: String) {
        let (run, spec) = {
            let mut tunnels = self.tunnels.write().await;
            let Some(entry) = tunnels.get_mut(id) else {
                return;
            };
            if entry.run.as_ref().map(|r| r.id) != Some(run_id) {
                return;
            }
            let Some(run) = entry.run.take() else {
                return;
            };
            entry.spec.status = TunnelStatus::Error;
            entry.spec.error_message = Some(message);
            entry.spec.started_at = None;
            (run, entry.snapshot())
        };

        warn!(
            "Tunnel {} failed: {}",
            id,
            spec.error_message.as_deref().unwrap_or_default()
        );
        self.finish_run(run).await;
        self.emit_status(&spec);
    }

    /// Cancel a run, wait for its listener to go away and give the
    /// connection reference back
    async fn finish_run(&self, run: ActiveRun) {
        run.cancel.cancel();
        if let Some(task) = run.task {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, task).await.is_err() {
                debug!("Accept loop did not finish in time");
            }
        }
        self.pool.release(&run.conn);
    }

    /// Stop accepting and force-close every relayed connection
    pub async fn stop(&self, id: &str) -> Result<TunnelSpec, TunnelError> {
        let (run, changed) = {
            let mut tunnels = self.tunnels.write().await;
            let entry = tunnels
                .get_mut(id)
                .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
            let changed = entry.spec.status != TunnelStatus::Stopped;
            if entry.starting {
                entry.stop_requested = true;
            }
            entry.spec.status = TunnelStatus::Stopped;
            entry.spec.error_message = None;
            entry.spec.started_at = None;
            (entry.run.take(), changed)
        };

        if let Some(run) = run {
            self.finish_run(run).await;
            info!("Stopped tunnel {}", id);
        }

        let spec = self
            .get(id)
            .await
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        if changed {
            self.emit_status(&spec);
        }
        Ok(spec)
    }

    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<TunnelSpec, TunnelError> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Stop first if running, then forget the tunnel
    pub async fn delete(&self, id: &str) -> Result<(), TunnelError> {
        self.stop(id).await?;
        let removed = self.tunnels.write().await.remove(id);
        let Some(entry) = removed else {
            return Err(TunnelError::NotFound(id.to_string()));
        };

        info!("Deleted tunnel {}", id);
        self.emitter.emit(TunnelEvent::Deleted {
            tunnel_id: entry.spec.id,
            asset_id: entry.spec.asset_id,
        });
        Ok(())
    }

    /// Edit a tunnel that is not running
    pub async fn update(&self, id: &str, update: TunnelUpdate) -> Result<TunnelSpec, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels
            .get_mut(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        if entry.run.is_some() || entry.starting {
            return Err(TunnelError::AlreadyRunning(id.to_string()));
        }

        let mut candidate = entry.spec.clone();
        if let Some(local_host) = update.local_host {
            candidate.local_host = local_host;
        }
        if let Some(local_port) = update.local_port {
            candidate.local_port = local_port;
        }
        if let Some(remote_host) = update.remote_host {
            candidate.remote_host = Some(remote_host);
        }
        if let Some(remote_port) = update.remote_port {
            candidate.remote_port = Some(remote_port);
        }
        if let Some(description) = update.description {
            candidate.description = Some(description);
        }
        candidate.validate()?;

        entry.spec = candidate;
        info!("Updated tunnel {}", id);
        Ok(entry.snapshot())
    }

    /// Stop every running tunnel (shutdown)
    pub async fn stop_all(&self) {
        let running: Vec<String> = self
            .tunnels
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.run.is_some() || e.starting)
            .map(|(id, _)| id.clone())
            .collect();

        info!("Stopping {} running tunnels", running.len());
        for id in running {
            if let Err(e) = self.stop(&id).await {
                debug!("Stop of {} during shutdown: {}", id, e);
            }
        }
    }

    fn emit_status(&self, spec: &TunnelSpec) {
        self.emitter.emit(TunnelEvent::StatusChanged {
            tunnel_id: spec.id.clone(),
            asset_id: spec.asset_id.clone(),
            status: spec.status,
            error: spec.error_message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::forwarding::events::{BroadcastEmitter, NoopEmitter};
    use crate::forwarding::local::tests::{wait_for, TcpOpener};
    use crate::ssh::connection_pool::tests::{pool_with, MockDialer};
    use crate::transport::TransportError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn manager_with(pool: Arc<ConnectionPool>, emitter: Arc<dyn EventEmitter>) -> Arc<TunnelManager> {
        Arc::new(
            TunnelManager::new(pool, emitter, &TunnelConfig::default())
                .with_stream_opener(Arc::new(|_: Arc<PooledConnection>| {
                    Arc::new(TcpOpener) as Arc<dyn StreamOpener>
                })),
        )
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    #[test]
    fn test_shape_validation() {
        let mut dynamic = TunnelSpec::dynamic("db", "127.0.0.1", 1080);
        assert!(dynamic.validate().is_ok());
        dynamic.remote_port = Some(80);
        assert!(matches!(dynamic.validate(), Err(TunnelError::Validation(_))));

        let mut local = TunnelSpec::local("db", "127.0.0.1", 8080, "localhost", 3306);
        assert!(local.validate().is_ok());
        local.remote_host = None;
        assert!(matches!(local.validate(), Err(TunnelError::Validation(_))));

        let zero_target = TunnelSpec::local("db", "127.0.0.1", 0, "localhost", 0);
        assert!(zero_target.validate().is_err());

        let mut remote = TunnelSpec::remote("db", "0.0.0.0", 9000, "127.0.0.1", 3000);
        assert!(remote.validate().is_ok());
        remote.remote_port = None;
        assert!(remote.validate().is_err());

        let blank_host = TunnelSpec::local("db", "", 8080, "localhost", 3306);
        assert!(blank_host.validate().is_err());
    }

    #[test]
    fn test_spec_wire_shape() {
        let spec = TunnelSpec::local("db", "127.0.0.1", 8080, "localhost", 3306).with_id("t-1");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "local");
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["remote_port"], 3306);

        let dynamic: TunnelSpec = serde_json::from_str(
            r#"{"id":"t-2","asset_id":"db","type":"dynamic","local_host":"127.0.0.1","local_port":1080}"#,
        )
        .unwrap();
        assert_eq!(dynamic.status, TunnelStatus::Stopped);
        assert!(dynamic.remote_host.is_none());
    }

    #[tokio::test]
    async fn test_create_forces_stopped_and_rejects_duplicates() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let manager = manager_with(pool, Arc::new(NoopEmitter));

        let mut spec = TunnelSpec::dynamic("db", "127.0.0.1", 0).with_id("socks");
        spec.status = TunnelStatus::Running;
        let created = manager.create(spec.clone()).await.unwrap();
        assert_eq!(created.status, TunnelStatus::Stopped);

        assert!(matches!(
            manager.create(spec).await,
            Err(TunnelError::Validation(_))
        ));
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_local_tunnel_end_to_end() {
        let target = echo_server().await;
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let manager = manager_with(pool.clone(), Arc::new(NoopEmitter));

        let spec = TunnelSpec::local("db", "127.0.0.1", 0, "127.0.0.1", target);
        let id = manager.create(spec).await.unwrap().id;

        let running = manager.start(&id).await.unwrap();
        assert_eq!(running.status, TunnelStatus::Running);
        assert!(running.started_at.is_some());
        assert_ne!(running.local_port, 0);
        assert_eq!(pool.stats().connections[0].ref_count, 1);

        let mut client = TcpStream::connect(("127.0.0.1", running.local_port))
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let manager_ref = manager.clone();
        let id_ref = id.clone();
        wait_for(move || {
            let stats = futures_util::FutureExt::now_or_never(manager_ref.stats(&id_ref));
            matches!(stats, Some(Ok(s)) if s.bytes_sent == 4 && s.bytes_received == 4)
        })
        .await;

        let stopped = manager.stop(&id).await.unwrap();
        assert_eq!(stopped.status, TunnelStatus::Stopped);
        assert_eq!(stopped.stats.bytes_sent, 4);
        assert!(TcpStream::connect(("127.0.0.1", running.local_port))
            .await
            .is_err());
        assert_eq!(pool.stats().connections[0].ref_count, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_stopped() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let manager = manager_with(pool.clone(), Arc::new(NoopEmitter));

        let id = manager
            .create(TunnelSpec::dynamic("db", "127.0.0.1", port))
            .await
            .unwrap()
            .id;
        let err = manager.start(&id).await.unwrap_err();
        assert!(matches!(err, TunnelError::Resource(_)));

        let spec = manager.get(&id).await.unwrap();
        assert_eq!(spec.status, TunnelStatus::Stopped);
        assert!(spec.error_message.is_none());
        assert_eq!(pool.stats().connections[0].ref_count, 0);
    }

    #[tokio::test]
    async fn test_dial_failure_sets_error() {
        let dialer = Arc::new(MockDialer {
            fail: true,
            ..MockDialer::new()
        });
        let pool = pool_with(PoolConfig::default(), dialer);
        let manager = manager_with(pool, Arc::new(NoopEmitter));

        let id = manager
            .create(TunnelSpec::dynamic("db", "127.0.0.1", 0))
            .await
            .unwrap()
            .id;
        let err = manager.start(&id).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Transport(TransportError::ConnectionRefused(_))
        ));

        let spec = manager.get(&id).await.unwrap();
        assert_eq!(spec.status, TunnelStatus::Error);
        assert!(!spec.error_message.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_connection_moves_tunnel_to_error() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let manager = manager_with(pool.clone(), Arc::new(NoopEmitter));

        let id = manager
            .create(TunnelSpec::dynamic("db", "127.0.0.1", 0))
            .await
            .unwrap()
            .id;
        let running = manager.start(&id).await.unwrap();

        let conn = pool.get("db").await.unwrap();
        conn.mark_dead("keepalive timeout");

        let manager_ref = manager.clone();
        let id_ref = id.clone();
        wait_for(move || {
            futures_util::FutureExt::now_or_never(manager_ref.get(&id_ref))
                .flatten()
                .is_some_and(|s| s.status == TunnelStatus::Error)
        })
        .await;

        let spec = manager.get(&id).await.unwrap();
        assert!(spec.error_message.unwrap().contains("keepalive timeout"));

        // The listener goes away shortly after the status flips
        let mut refused = false;
        for _ in 0..200 {
            if TcpStream::connect(("127.0.0.1", running.local_port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);
        pool.release(&conn);
    }

    #[tokio::test]
    async fn test_remote_tunnel_registers_route() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let manager = manager_with(pool.clone(), Arc::new(NoopEmitter));

        let id = manager
            .create(TunnelSpec::remote("db", "0.0.0.0", 9000, "127.0.0.1", 3000))
            .await
            .unwrap()
            .id;
        let running = manager.start(&id).await.unwrap();
        assert_eq!(running.remote_port, Some(9000));

        let conn = pool.get("db").await.unwrap();
        let route = conn.forwards().lookup("0.0.0.0", 9000).unwrap();
        assert_eq!(route.tunnel_id, id);
        assert_eq!(route.local_port, 3000);

        manager.stop(&id).await.unwrap();
        let forwards = conn.forwards().clone();
        wait_for(move || forwards.is_empty()).await;
        pool.release(&conn);
    }

    #[tokio::test]
    async fn test_running_tunnel_rejects_update_and_second_start() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let manager = manager_with(pool, Arc::new(NoopEmitter));

        let id = manager
            .create(TunnelSpec::dynamic("db", "127.0.0.1", 0))
            .await
            .unwrap()
            .id;
        manager.start(&id).await.unwrap();

        assert!(matches!(
            manager.start(&id).await,
            Err(TunnelError::AlreadyRunning(_))
        ));
        let update = TunnelUpdate {
            local_port: Some(1081),
            ..Default::default()
        };
        assert!(matches!(
            manager.update(&id, update.clone()).await,
            Err(TunnelError::AlreadyRunning(_))
        ));

        manager.stop(&id).await.unwrap();
        let updated = manager.update(&id, update).await.unwrap();
        assert_eq!(updated.local_port, 1081);

        let bad = TunnelUpdate {
            remote_host: Some("example.com".into()),
            ..Default::default()
        };
        assert!(matches!(
            manager.update(&id, bad).await,
            Err(TunnelError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_list_and_delete() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let emitter = Arc::new(BroadcastEmitter::new(16));
        let mut events = emitter.subscribe();
        let manager = manager_with(pool, emitter.clone());

        let mut persisted = TunnelSpec::local("db", "127.0.0.1", 0, "localhost", 5432).with_id("a");
        persisted.status = TunnelStatus::Running;
        persisted.error_message = Some("stale".into());
        let other_asset = TunnelSpec::dynamic("web", "127.0.0.1", 0).with_id("b");
        let mut invalid = TunnelSpec::dynamic("db", "127.0.0.1", 0).with_id("c");
        invalid.remote_host = Some("nope".into());

        assert_eq!(manager.restore(vec![persisted, other_asset, invalid]).await, 2);
        let restored = manager.get("a").await.unwrap();
        assert_eq!(restored.status, TunnelStatus::Stopped);
        assert!(restored.error_message.is_none());
        assert_eq!(manager.list_by_asset("db").await.len(), 1);

        manager.start("b").await.unwrap();
        manager.delete("b").await.unwrap();
        assert!(manager.get("b").await.is_none());
        assert!(matches!(
            manager.delete("b").await,
            Err(TunnelError::NotFound(_))
        ));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(
            &seen[0],
            TunnelEvent::StatusChanged { status: TunnelStatus::Running, .. }
        ));
        assert!(matches!(
            &seen[1],
            TunnelEvent::StatusChanged { status: TunnelStatus::Stopped, .. }
        ));
        assert!(matches!(&seen[2], TunnelEvent::Deleted { tunnel_id, .. } if tunnel_id == "b"));
    }

    #[tokio::test]
    async fn test_stop_all_stops_running_tunnels() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let manager = manager_with(pool.clone(), Arc::new(NoopEmitter));

        for _ in 0..2 {
            let id = manager
                .create(TunnelSpec::dynamic("db", "127.0.0.1", 0))
                .await
                .unwrap()
                .id;
            manager.start(&id).await.unwrap();
        }
        assert_eq!(pool.stats().connections[0].ref_count, 2);

        manager.stop_all().await;
        assert!(manager
            .list()
            .await
            .iter()
            .all(|s| s.status == TunnelStatus::Stopped));
        assert_eq!(pool.stats().connections[0].ref_count, 0);
    }

    #[tokio::test]
    async fn test_stop_during_start_wins() {
        let dialer = Arc::new(MockDialer {
            delay: Duration::from_millis(300),
            ..MockDialer::new()
        });
        let pool = pool_with(PoolConfig::default(), dialer);
        let manager = manager_with(pool.clone(), Arc::new(NoopEmitter));

        let id = manager
            .create(TunnelSpec::dynamic("db", "127.0.0.1", 0))
            .await
            .unwrap()
            .id;
        let starting = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.start(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = manager.stop(&id).await.unwrap();
        assert_eq!(stopped.status, TunnelStatus::Stopped);

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(TunnelError::Stopped(_))));

        let spec = manager.get(&id).await.unwrap();
        assert_eq!(spec.status, TunnelStatus::Stopped);
        assert!(spec.started_at.is_none());
        assert_eq!(pool.stats().connections[0].ref_count, 0);

        // A later start is not affected by the earlier stop
        let running = manager.start(&id).await.unwrap();
        assert_eq!(running.status, TunnelStatus::Running);
        manager.stop(&id).await.unwrap();
    }
}
