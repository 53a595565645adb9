//! SSH transports on a pooled connection
//!
//! [`SshShell`] runs one channel task per terminal: it owns the session
//! channel, applies input and window changes in arrival order, and moves
//! output into the bounded queue with a reserve-then-read loop so a full
//! queue stops channel reads. The connection's dead token is part of the
//! select, so a pool-side Dead fails the shell at once.
//!
//! [`DirectTcpip`] opens forwarding channels for tunnels.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BoxedStream, StreamOpener, TransportError, TransportEvent};
use crate::ssh::{ConnectionPool, PooledConnection};

const COMMAND_QUEUE: usize = 256;

enum ShellCommand {
    Data(Bytes),
    Resize {
        cols: u16,
        rows: u16,
        reply_tx: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// What the channel task reads off a session channel
#[derive(Debug)]
pub(crate) enum ShellMsg {
    /// stdout or stderr
    Data(Bytes),
    ExitStatus(u32),
    Eof,
    Other,
}

/// The side of a session channel the channel task drives.
/// `next_message` returning `None` means the channel is gone.
#[async_trait]
pub(crate) trait ShellChannel: Send + 'static {
    async fn write_data(&mut self, data: &[u8]) -> Result<(), String>;
    async fn resize_pty(&mut self, cols: u16, rows: u16) -> Result<(), String>;
    async fn next_message(&mut self) -> Option<ShellMsg>;
    async fn close_channel(&mut self);
}

#[async_trait]
impl ShellChannel for Channel<Msg> {
    async fn write_data(&mut self, data: &[u8]) -> Result<(), String> {
        self.data(data).await.map_err(|e| e.to_string())
    }

    async fn resize_pty(&mut self, cols: u16, rows: u16) -> Result<(), String> {
        self.window_change(cols as u32, rows as u32, 0, 0)
            .await
            .map_err(|e| e.to_string())
    }

    async fn next_message(&mut self) -> Option<ShellMsg> {
        let msg = match self.wait().await? {
            ChannelMsg::Data { data } => ShellMsg::Data(Bytes::copy_from_slice(&data)),
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                ShellMsg::Data(Bytes::copy_from_slice(&data))
            }
            ChannelMsg::ExitStatus { exit_status } => ShellMsg::ExitStatus(exit_status),
            ChannelMsg::Eof => ShellMsg::Eof,
            ChannelMsg::Close => return None,
            _ => ShellMsg::Other,
        };
        Some(msg)
    }

    async fn close_channel(&mut self) {
        let _ = self.eof().await;
        let _ = self.close().await;
    }
}

/// Interactive shell on a session channel. Holds one pool reference, given
/// back on `close` or drop.
pub struct SshShell {
    cmd_tx: mpsc::Sender<ShellCommand>,
    closed: CancellationToken,
    conn: Arc<PooledConnection>,
    pool: Arc<ConnectionPool>,
    released: AtomicBool,
}

impl SshShell {
    pub async fn open(
        pool: &Arc<ConnectionPool>,
        asset_id: &str,
        cols: u16,
        rows: u16,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let conn = pool.get(asset_id).await?;

        let channel = match start_shell(&conn, cols, rows).await {
            Ok(channel) => channel,
            Err(e) => {
                pool.release(&conn);
                return Err(e);
            }
        };
        info!("Interactive shell started on {} ({}x{})", asset_id, cols, rows);

        Ok(Self::attach(pool, conn, channel, capacity))
    }

    /// Drive `channel` on `conn`, taking over the reference the caller got
    /// from the pool
    pub(crate) fn attach(
        pool: &Arc<ConnectionPool>,
        conn: Arc<PooledConnection>,
        channel: impl ShellChannel,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        tokio::spawn(channel_task(
            channel,
            cmd_rx,
            out_tx,
            conn.clone(),
            closed.clone(),
        ));

        (
            Self {
                cmd_tx,
                closed,
                conn,
                pool: pool.clone(),
                released: AtomicBool::new(false),
            },
            out_rx,
        )
    }

    pub async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.cmd_tx
            .send(ShellCommand::Data(data))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ShellCommand::Resize {
                cols,
                rows,
                reply_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    pub async fn close(&self) {
        self.closed.cancel();
        self.release();
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pool.release(&self.conn);
        }
    }
}

impl Drop for SshShell {
    fn drop(&mut self) {
        self.closed.cancel();
        self.release();
    }
}

async fn start_shell(
    conn: &PooledConnection,
    cols: u16,
    rows: u16,
) -> Result<Channel<Msg>, TransportError> {
    let channel = conn.controller().open_session_channel().await?;
    channel
        .request_pty(false, "xterm-256color", cols as u32, rows as u32, 0, 0, &[])
        .await
        .map_err(|e| TransportError::Channel(format!("PTY request failed: {}", e)))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| TransportError::Channel(format!("Shell request failed: {}", e)))?;
    Ok(channel)
}

async fn channel_task<C: ShellChannel>(
    mut channel: C,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    out_tx: mpsc::Sender<TransportEvent>,
    conn: Arc<PooledConnection>,
    closed: CancellationToken,
) {
    let asset_id = conn.asset_id().to_string();
    let dead = conn.dead_token();
    let mut pending: Option<TransportEvent> = None;
    let mut exit_status: Option<u32> = None;

    let failure = loop {
        tokio::select! {
            biased;

            _ = dead.cancelled() => {
                let reason = conn
                    .dead_reason()
                    .unwrap_or_else(|| "SSH connection lost".to_string());
                break Some(reason);
            }

            _ = closed.cancelled() => {
                channel.close_channel().await;
                debug!("Shell channel on {} closed locally", asset_id);
                return;
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(ShellCommand::Data(data)) => {
                    if let Err(e) = channel.write_data(&data).await {
                        break Some(format!("write to SSH channel failed: {}", e));
                    }
                    conn.touch();
                }
                Some(ShellCommand::Resize { cols, rows, reply_tx }) => {
                    debug!("Sending window_change {}x{} on {}", cols, rows, asset_id);
                    let result = channel
                        .resize_pty(cols, rows)
                        .await
                        .map_err(|e| TransportError::Channel(format!("window change failed: {}", e)));
                    let _ = reply_tx.send(result);
                }
                None => {
                    channel.close_channel().await;
                    debug!("Shell handle on {} dropped", asset_id);
                    return;
                }
            },

            permit = out_tx.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(event) = pending.take() {
                        permit.send(event);
                    }
                }
                Err(_) => {
                    debug!("Shell output receiver dropped on {}", asset_id);
                    channel.close_channel().await;
                    return;
                }
            },

            msg = channel.next_message(), if pending.is_none() => match msg {
                Some(ShellMsg::Data(data)) => {
                    pending = Some(TransportEvent::Data(data));
                    conn.touch();
                }
                Some(ShellMsg::ExitStatus(status)) => {
                    info!("Remote shell on {} exited with status {}", asset_id, status);
                    exit_status = Some(status);
                }
                Some(ShellMsg::Eof) => {
                    debug!("Shell channel EOF on {}", asset_id);
                }
                Some(ShellMsg::Other) => {}
                None => break None,
            },
        }
    };

    if let Some(event) = pending.take() {
        let _ = out_tx.send(event).await;
    }
    match failure {
        Some(reason) => {
            warn!("Shell on {} failed: {}", asset_id, reason);
            let _ = out_tx.send(TransportEvent::Failed(reason)).await;
        }
        None => {
            let _ = out_tx.send(TransportEvent::Exited(exit_status)).await;
        }
    }
}

/// Opens `direct-tcpip` channels on a pooled connection and hands them out
/// as plain byte streams
pub struct DirectTcpip {
    conn: Arc<PooledConnection>,
}

impl DirectTcpip {
    pub fn new(conn: Arc<PooledConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StreamOpener for DirectTcpip {
    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TransportError> {
        if !self.conn.is_alive() {
            return Err(TransportError::Closed);
        }
        let channel = self
            .conn
            .controller()
            .open_direct_tcpip(
                host,
                port as u32,
                &originator.ip().to_string(),
                originator.port() as u32,
            )
            .await?;
        self.conn.touch();
        debug!(
            "direct-tcpip to {}:{} opened on {} for {}",
            host,
            port,
            self.conn.asset_id(),
            originator
        );
        Ok(Box::new(channel.into_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::bridge::ServerMessage;
    use crate::config::SessionConfig;
    use crate::session::{Outbound, TerminalSession};
    use crate::ssh::connection_pool::tests::{pool_with, MockDialer};
    use crate::transport::AssetTransport;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// In-memory session channel: output is scripted, writes wait on `gate`
    struct FakeChannel {
        output: mpsc::UnboundedReceiver<ShellMsg>,
        written: mpsc::UnboundedSender<Bytes>,
        gate: Arc<Semaphore>,
        closed: Arc<AtomicBool>,
    }

    struct FakeEnd {
        output: mpsc::UnboundedSender<ShellMsg>,
        written: mpsc::UnboundedReceiver<Bytes>,
        gate: Arc<Semaphore>,
        closed: Arc<AtomicBool>,
    }

    fn fake_channel(write_permits: usize) -> (FakeChannel, FakeEnd) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(write_permits));
        let closed = Arc::new(AtomicBool::new(false));
        (
            FakeChannel {
                output: output_rx,
                written: written_tx,
                gate: gate.clone(),
                closed: closed.clone(),
            },
            FakeEnd {
                output: output_tx,
                written: written_rx,
                gate,
                closed,
            },
        )
    }

    #[async_trait]
    impl ShellChannel for FakeChannel {
        async fn write_data(&mut self, data: &[u8]) -> Result<(), String> {
            self.gate.acquire().await.map_err(|e| e.to_string())?.forget();
            let _ = self.written.send(Bytes::copy_from_slice(data));
            Ok(())
        }

        async fn resize_pty(&mut self, _cols: u16, _rows: u16) -> Result<(), String> {
            Ok(())
        }

        async fn next_message(&mut self) -> Option<ShellMsg> {
            self.output.recv().await
        }

        async fn close_channel(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> Option<TransportEvent> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for shell event")
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("attachment closed")
    }

    #[tokio::test]
    async fn test_direct_tcpip_refuses_on_dead_connection() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let conn = pool.get("db").await.unwrap();
        conn.mark_dead("test");

        let opener = DirectTcpip::new(conn.clone());
        let err = opener
            .open_stream("localhost", 80, "127.0.0.1:5000".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Closed));
        pool.release(&conn);
    }

    #[tokio::test]
    async fn test_shell_open_failure_releases_reference() {
        // The mock owner rejects channel opens
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let result = SshShell::open(&pool, "db", 80, 24, 8).await;
        assert!(matches!(result, Err(TransportError::Channel(_))));

        let stats = pool.stats();
        assert_eq!(stats.connections.len(), 1);
        assert_eq!(stats.connections[0].ref_count, 0);
    }

    #[tokio::test]
    async fn test_shell_relays_output_and_input() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let conn = pool.get("db").await.unwrap();
        let (channel, mut end) = fake_channel(16);
        let (shell, mut rx) = SshShell::attach(&pool, conn.clone(), channel, 8);

        end.output.send(ShellMsg::Data(Bytes::from("$ "))).unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            Some(TransportEvent::Data(Bytes::from("$ ")))
        );

        shell.write(Bytes::from("ls\n")).await.unwrap();
        let written = tokio::time::timeout(Duration::from_secs(2), end.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, Bytes::from("ls\n"));
        shell.resize(120, 40).await.unwrap();

        end.output.send(ShellMsg::ExitStatus(0)).unwrap();
        drop(end.output);
        assert_eq!(next_event(&mut rx).await, Some(TransportEvent::Exited(Some(0))));

        shell.close().await;
        assert_eq!(conn.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_connection_fails_attached_shell() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let conn = pool.get("db").await.unwrap();
        let (channel, end) = fake_channel(16);
        let (shell, mut rx) = SshShell::attach(&pool, conn.clone(), channel, 8);

        end.output.send(ShellMsg::Data(Bytes::from("top\r\n"))).unwrap();
        assert!(matches!(next_event(&mut rx).await, Some(TransportEvent::Data(_))));

        conn.mark_dead("keepalive timeout");
        assert_eq!(
            next_event(&mut rx).await,
            Some(TransportEvent::Failed("keepalive timeout".into()))
        );
        assert!(matches!(
            shell.write(Bytes::from("q")).await,
            Err(TransportError::Closed)
        ));

        shell.close().await;
        assert_eq!(conn.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_connection_closes_terminal_session() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let conn = pool.get("db").await.unwrap();
        let (channel, _end) = fake_channel(16);
        let config = SessionConfig::default();
        let (shell, rx) = SshShell::attach(&pool, conn.clone(), channel, config.output_queue_capacity);

        let session = TerminalSession::new("s-ssh", "db", &config);
        session.start((AssetTransport::SshShell(shell), rx)).unwrap();
        let mut attachment = session.attach().unwrap();

        conn.mark_dead("keepalive timeout");
        assert_eq!(
            next_frame(&mut attachment.rx).await,
            Outbound::Control(ServerMessage::error("io", "keepalive timeout"))
        );
        assert_eq!(
            next_frame(&mut attachment.rx).await,
            Outbound::Control(ServerMessage::TermClosed {
                reason: "keepalive timeout".into()
            })
        );
        assert!(matches!(
            next_frame(&mut attachment.rx).await,
            Outbound::Close(_)
        ));
        assert!(session.is_closed());
        assert_eq!(conn.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_seen_with_a_full_command_queue() {
        let pool = pool_with(PoolConfig::default(), Arc::new(MockDialer::new()));
        let conn = pool.get("db").await.unwrap();
        // No write permits: the channel task blocks on the first write
        let (channel, end) = fake_channel(0);
        let (shell, _rx) = SshShell::attach(&pool, conn.clone(), channel, 8);

        for _ in 0..=COMMAND_QUEUE {
            shell.write(Bytes::from("x")).await.unwrap();
        }
        shell.close().await;
        assert_eq!(conn.ref_count(), 0);

        end.gate.add_permits(1);
        let closed = end.closed.clone();
        let mut seen = false;
        for _ in 0..200 {
            if closed.load(Ordering::SeqCst) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
    }
}
