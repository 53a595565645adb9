//! Bidirectional byte relay for tunnel connections
//!
//! Every accepted tunnel connection runs one relay: two copy loops over the
//! split halves of the local socket and the SSH-side stream. Whichever
//! direction finishes first (EOF, error, idle, cancel) tears down both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TunnelConfig;

/// Lock-free traffic counters shared by every connection of one tunnel
#[derive(Debug, Default)]
pub struct TrafficCounters {
    /// Local side -> SSH side
    pub bytes_sent: AtomicU64,
    /// SSH side -> local side
    pub bytes_received: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an accepted connection until the guard drops
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counters: self.clone(),
        }
    }

    pub fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
        }
    }
}

/// Decrements `active_connections` on drop
pub struct ConnectionGuard {
    counters: Arc<TrafficCounters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counters
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time tunnel statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u64,
    pub total_connections: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub buffer_size: usize,
    /// Both directions silent for this long ends the connection
    pub idle_timeout: Duration,
}

impl From<&TunnelConfig> for RelayOptions {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from(&TunnelConfig::default())
    }
}

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    LocalClosed,
    RemoteClosed,
    Idle,
    Cancelled,
}

/// Relay bytes between `local` and `remote` until either side closes.
///
/// Byte counts go to `counters` as they are written, so stats are live while
/// the connection is open.
pub async fn relay<L, R>(
    local: L,
    remote: R,
    counters: Arc<TrafficCounters>,
    opts: RelayOptions,
    cancel: CancellationToken,
) -> RelayEnd
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);

    let upstream = copy_counted(
        local_read,
        remote_write,
        &counters.bytes_sent,
        &last_activity,
        started,
        opts.buffer_size,
    );
    let downstream = copy_counted(
        remote_read,
        local_write,
        &counters.bytes_received,
        &last_activity,
        started,
        opts.buffer_size,
    );
    let idle = idle_watchdog(&last_activity, started, opts.idle_timeout);

    let end = tokio::select! {
        _ = cancel.cancelled() => RelayEnd::Cancelled,
        _ = upstream => RelayEnd::LocalClosed,
        _ = downstream => RelayEnd::RemoteClosed,
        _ = idle => RelayEnd::Idle,
    };
    debug!("Relay ended: {:?}", end);
    end
}

async fn copy_counted<R, W>(
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    last_activity: &AtomicU64,
    started: Instant,
    buffer_size: usize,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

async fn idle_watchdog(last_activity: &AtomicU64, started: Instant, idle_timeout: Duration) {
    let idle_ms = idle_timeout.as_millis() as u64;
    let check_every = (idle_timeout / 4).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(check_every).await;
        let now = started.elapsed().as_millis() as u64;
        if now.saturating_sub(last_activity.load(Ordering::Relaxed)) >= idle_ms {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn opts() -> RelayOptions {
        RelayOptions {
            buffer_size: 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (mut client, local) = duplex(4096);
        let (remote, mut server) = duplex(4096);
        let counters = Arc::new(TrafficCounters::new());

        let task = tokio::spawn(relay(
            local,
            remote,
            counters.clone(),
            opts(),
            CancellationToken::new(),
        ));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        assert_eq!(task.await.unwrap(), RelayEnd::LocalClosed);

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 5);
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_the_other() {
        let (client, local) = duplex(1024);
        let (remote, mut server) = duplex(1024);

        let task = tokio::spawn(relay(
            local,
            remote,
            Arc::new(TrafficCounters::new()),
            opts(),
            CancellationToken::new(),
        ));
        drop(client);
        task.await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_force_closes() {
        let (_client, local) = duplex(1024);
        let (remote, _server) = duplex(1024);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(relay(
            local,
            remote,
            Arc::new(TrafficCounters::new()),
            opts(),
            cancel.clone(),
        ));
        cancel.cancel();
        assert_eq!(task.await.unwrap(), RelayEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (_client, local) = duplex(1024);
        let (remote, _server) = duplex(1024);
        let end = relay(
            local,
            remote,
            Arc::new(TrafficCounters::new()),
            RelayOptions {
                buffer_size: 64,
                idle_timeout: Duration::from_millis(50),
            },
            CancellationToken::new(),
        )
        .await;
        assert_eq!(end, RelayEnd::Idle);
    }

    #[test]
    fn test_connection_guard_tracks_active() {
        let counters = Arc::new(TrafficCounters::new());
        let a = counters.open_connection();
        let b = counters.open_connection();
        assert_eq!(counters.snapshot().active_connections, 2);
        drop(a);
        drop(b);
        let stats = counters.snapshot();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 2);
    }
}
