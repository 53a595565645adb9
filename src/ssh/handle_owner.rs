//! Handle Owner Task
//!
//! One task owns the russh `Handle` of a pooled connection. Terminals,
//! tunnels and the pool keepalive reach it through a cloneable
//! [`HandleController`], so channel opens from many consumers never contend
//! for a lock on the handle.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, Vec::new(), asset_id);
//! let shell = controller.open_session_channel().await?;
//! let port = controller.tcpip_forward("0.0.0.0", 8080).await?;
//! ```

use std::ops::ControlFlow;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll period for noticing the transport closed underneath the owner
const CLOSED_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const COMMAND_QUEUE: usize = 64;

/// Outcome of a keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time; may be transient
    Timeout,
    /// The transport is gone
    IoError,
}

type Reply<T> = oneshot::Sender<Result<T, russh::Error>>;

pub enum HandleCommand {
    /// Session channel for a PTY shell
    OpenSession { reply: Reply<Channel<Msg>> },
    /// direct-tcpip channel (local/dynamic tunnels, jump hops)
    OpenDirectTcpip {
        host: String,
        port: u32,
        origin_host: String,
        origin_port: u32,
        reply: Reply<Channel<Msg>>,
    },
    /// Ask the server to listen (tcpip-forward); replies with the bound port
    Listen {
        address: String,
        port: u32,
        reply: Reply<u32>,
    },
    Unlisten {
        address: String,
        port: u32,
        reply: Reply<()>,
    },
    Ping { reply: oneshot::Sender<PingResult> },
    Disconnect,
}

impl HandleCommand {
    /// Answer a command that will never run
    pub(crate) fn reject(self) {
        match self {
            HandleCommand::OpenSession { reply } | HandleCommand::OpenDirectTcpip { reply, .. } => {
                let _ = reply.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Listen { reply, .. } => {
                let _ = reply.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Unlisten { reply, .. } => {
                let _ = reply.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply } => {
                let _ = reply.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

/// Cloneable access to one connection's owner task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller around an arbitrary command queue, for scripted owners in
    /// tests; production code uses [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Yields (or reports `Closed`) when the owner task exits
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> HandleCommand,
    ) -> Result<Result<T, russh::Error>, SshError> {
        let (reply, answer) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .await
            .map_err(|_| SshError::Disconnected)?;
        answer.await.map_err(|_| SshError::Disconnected)
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        self.call(|reply| HandleCommand::OpenSession { reply })
            .await?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        origin_host: &str,
        origin_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        self.call(|reply| HandleCommand::OpenDirectTcpip {
            host: host.to_string(),
            port,
            origin_host: origin_host.to_string(),
            origin_port,
            reply,
        })
        .await?
        .map_err(|e| SshError::ChannelError(format!("direct-tcpip to {}:{}: {}", host, port, e)))
    }

    /// Server-side listener for a remote forward. Returns the bound port,
    /// which differs from `port` when 0 was requested.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        self.call(|reply| HandleCommand::Listen {
            address: address.to_string(),
            port,
            reply,
        })
        .await?
        .map_err(|e| SshError::ChannelError(format!("tcpip-forward rejected: {}", e)))
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        self.call(|reply| HandleCommand::Unlisten {
            address: address.to_string(),
            port,
            reply,
        })
        .await?
        .map_err(SshError::from)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        let (reply, answer) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply }).await.is_err() {
            return PingResult::IoError;
        }
        answer.await.unwrap_or(PingResult::IoError)
    }

    /// Whether the owner task still accepts commands
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

struct HandleOwner {
    handle: Handle<ClientHandler>,
    /// Intermediate hops of a jump chain; they live exactly as long as the target
    _jump_handles: Vec<Handle<ClientHandler>>,
    asset_id: String,
}

/// Move `handle` into its owner task and return the controller
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    jump_handles: Vec<Handle<ClientHandler>>,
    asset_id: String,
) -> HandleController {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let controller = HandleController::new(cmd_tx);
    let disconnect_tx = controller.disconnect_tx.clone();

    let owner = HandleOwner {
        handle,
        _jump_handles: jump_handles,
        asset_id,
    };
    tokio::spawn(async move {
        owner.run(cmd_rx, disconnect_tx).await;
    });
    controller
}

impl HandleOwner {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<HandleCommand>, disconnect_tx: broadcast::Sender<()>) {
        info!("Handle owner started for asset {}", self.asset_id);
        let mut closed_check = tokio::time::interval(CLOSED_CHECK_INTERVAL);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("All controllers for asset {} dropped", self.asset_id);
                        break;
                    };
                    if self.execute(cmd).await.is_break() {
                        break;
                    }
                }
                // Peer hung up, or the russh keepalive gave up
                _ = closed_check.tick() => {
                    if self.handle.is_closed() {
                        warn!("SSH transport closed for asset {}", self.asset_id);
                        break;
                    }
                }
            }
        }

        let _ = disconnect_tx.send(());
        reject_pending(&mut cmd_rx);
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "Connection closed", "en")
            .await;
        info!("Handle owner for asset {} terminated", self.asset_id);
    }

    async fn execute(&mut self, cmd: HandleCommand) -> ControlFlow<()> {
        match cmd {
            HandleCommand::OpenSession { reply } => {
                let result = self.handle.channel_open_session().await;
                if reply.send(result).is_err() {
                    debug!("Session channel on {} opened for a caller that left", self.asset_id);
                }
            }
            HandleCommand::OpenDirectTcpip {
                host,
                port,
                origin_host,
                origin_port,
                reply,
            } => {
                let result = self
                    .handle
                    .channel_open_direct_tcpip(&host, port, &origin_host, origin_port)
                    .await;
                if reply.send(result).is_err() {
                    debug!("direct-tcpip to {}:{} opened for a caller that left", host, port);
                }
            }
            HandleCommand::Listen {
                address,
                port,
                reply,
            } => match self.handle.tcpip_forward(&address, port).await {
                Ok(bound) => {
                    if reply.send(Ok(bound)).is_err() {
                        // Nobody else knows about this listener
                        warn!("Remote listener {}:{} orphaned, cancelling", address, bound);
                        let _ = self.handle.cancel_tcpip_forward(&address, bound).await;
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            HandleCommand::Unlisten {
                address,
                port,
                reply,
            } => {
                let _ = reply.send(self.handle.cancel_tcpip_forward(&address, port).await);
            }
            HandleCommand::Ping { reply } => {
                let _ = reply.send(self.ping().await);
            }
            HandleCommand::Disconnect => {
                info!("Disconnect requested for asset {}", self.asset_id);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn ping(&mut self) -> PingResult {
        match tokio::time::timeout(PING_TIMEOUT, self.handle.send_keepalive(true)).await {
            Ok(Ok(())) => PingResult::Ok,
            Ok(Err(russh::Error::Disconnect)) | Ok(Err(russh::Error::IO(_))) => PingResult::IoError,
            Ok(Err(e)) => {
                debug!("Soft keepalive error on {}: {}", self.asset_id, e);
                PingResult::Timeout
            }
            Err(_) => PingResult::Timeout,
        }
    }
}

fn reject_pending(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        cmd.reject();
    }
}
