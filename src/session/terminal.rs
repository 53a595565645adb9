//! Terminal Session
//!
//! One terminal: an [`AssetTransport`], the ring buffer of its output and at
//! most one attached WebSocket writer.
//!
//! Exactly one task (the output pump) reads the transport. It waits on the
//! [`FlowGate`] before taking each chunk, appends the chunk to the ring and
//! hands it to the current attachment, if any. The WebSocket side calls
//! back through [`TerminalSession::flushed`] once bytes hit the socket.
//!
//! ```text
//! transport ──▶ pump ──▶ ring ──▶ attachment queue ──▶ WS writer
//!                 ▲                                        │
//!                 └──────────── FlowGate ◀── flushed ──────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::flow::FlowGate;
use super::ring_buffer::RingBuffer;
use super::SessionError;
use crate::bridge::protocol::ServerMessage;
use crate::config::SessionConfig;
use crate::transport::{AssetTransport, OpenedTransport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Paused,
    Closed,
}

/// What the WS writer of an attachment sends, in queue order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw terminal output (binary frame)
    Output(Bytes),
    /// JSON control frame
    Control(ServerMessage),
    /// End of this attachment; the writer closes the socket
    Close(String),
}

/// A WebSocket's hold on a session
pub struct Attachment {
    pub epoch: u64,
    pub rx: mpsc::UnboundedReceiver<Outbound>,
    /// Size of the replay frame queued ahead of live output
    pub replay_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub asset_id: String,
    pub state: SessionState,
    pub attached: bool,
    pub buffered_lines: usize,
    pub buffered_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

struct Sink {
    epoch: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Ring and attachment change together so replay and live output never
/// interleave.
struct Shared {
    ring: RingBuffer,
    sink: Option<Sink>,
}

pub struct TerminalSession {
    id: Mutex<String>,
    asset_id: String,
    transport: OnceLock<AssetTransport>,
    shared: Mutex<Shared>,
    flow: FlowGate,
    cancel: CancellationToken,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
    /// Set while nobody is attached; drives the reconnect grace period
    detached_at: Mutex<Option<Instant>>,
    max_request_lines: usize,
}

impl TerminalSession {
    /// A session in `Connecting` until [`start`](Self::start) hands it a transport
    pub fn new(id: impl Into<String>, asset_id: impl Into<String>, config: &SessionConfig) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: Mutex::new(id.into()),
            asset_id: asset_id.into(),
            transport: OnceLock::new(),
            shared: Mutex::new(Shared {
                ring: RingBuffer::new(
                    config.ring_capacity_lines,
                    config.ring_capacity_bytes,
                    config.max_line_bytes,
                ),
                sink: None,
            }),
            flow: FlowGate::new(config.high_watermark, config.low_watermark),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            created_at: now,
            last_active: Mutex::new(now),
            detached_at: Mutex::new(Some(Instant::now())),
            max_request_lines: config.max_output_request_lines.max(1),
        })
    }

    /// Install the opened transport and start the output pump
    pub fn start(self: &Arc<Self>, opened: OpenedTransport) -> Result<(), SessionError> {
        let (transport, rx) = opened;
        if self.is_closed() {
            tokio::spawn(async move { transport.close().await });
            return Err(SessionError::Closed(self.id()));
        }
        let kind = transport.kind();
        if let Err(transport) = self.transport.set(transport) {
            tokio::spawn(async move { transport.close().await });
            return Err(SessionError::AlreadyStarted(self.id()));
        }

        info!("Session {} active on asset {} ({})", self.id(), self.asset_id, kind);
        let session = self.clone();
        tokio::spawn(async move { session.pump_output(rx).await });
        Ok(())
    }

    async fn pump_output(self: Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.flow.wait_open() => {}
            }

            // A pause that lands while we wait for data wins over the data
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = self.flow.wait_closed() => continue,
                event = rx.recv() => event,
            };

            match event {
                Some(TransportEvent::Data(chunk)) => self.deliver(chunk),
                Some(TransportEvent::Exited(status)) => {
                    let reason = match status {
                        Some(code) => format!("process exited with status {}", code),
                        None => "process exited".to_string(),
                    };
                    self.close(&reason).await;
                    return;
                }
                Some(TransportEvent::Failed(message)) => {
                    warn!("Session {} transport failed: {}", self.id(), message);
                    self.send_control(ServerMessage::error("io", message.clone()));
                    self.close(&message).await;
                    return;
                }
                None => {
                    self.close("transport closed").await;
                    return;
                }
            }
        }
    }

    fn deliver(&self, chunk: Bytes) {
        {
            let mut shared = self.shared.lock();
            shared.ring.push(&chunk);
            if let Some(sink) = &shared.sink {
                self.flow.queued(sink.epoch, chunk.len());
                // A dead writer is cleaned up by its own detach
                let _ = sink.tx.send(Outbound::Output(chunk));
            }
        }
        self.touch();
    }

    /// Queue a control frame for the current attachment, if any
    pub fn send_control(&self, message: ServerMessage) {
        let shared = self.shared.lock();
        if let Some(sink) = &shared.sink {
            let _ = sink.tx.send(Outbound::Control(message));
        }
    }

    /// Attach a WebSocket. The buffered output is queued as the first frame,
    /// and any previous attachment is told to go away.
    pub fn attach(&self) -> Result<Attachment, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        if self.is_closed() {
            return Err(SessionError::Closed(self.id()));
        }

        let epoch = self.flow.attach();
        let replay = shared.ring.snapshot();
        let replay_bytes = replay.len();
        if replay_bytes > 0 {
            self.flow.queued(epoch, replay_bytes);
            let _ = tx.send(Outbound::Output(replay));
        }

        if let Some(old) = shared.sink.replace(Sink { epoch, tx }) {
            debug!("Session {} attachment {} superseded", self.id(), old.epoch);
            let _ = old.tx.send(Outbound::Close("superseded".to_string()));
        }
        drop(shared);

        *self.detached_at.lock() = None;
        info!(
            "Session {} attached (epoch {}, replay {} bytes)",
            self.id(),
            epoch,
            replay_bytes
        );
        Ok(Attachment {
            epoch,
            rx,
            replay_bytes,
        })
    }

    /// Drop attachment `epoch`; a superseded epoch is a no-op
    pub fn detach(&self, epoch: u64) {
        let mut shared = self.shared.lock();
        let current = shared.sink.as_ref().is_some_and(|sink| sink.epoch == epoch);
        if !current {
            return;
        }
        shared.sink = None;
        self.flow.detach(epoch);
        drop(shared);

        *self.detached_at.lock() = Some(Instant::now());
        info!("Session {} detached (epoch {})", self.id(), epoch);
    }

    /// `bytes` of attachment `epoch` reached the socket
    pub fn flushed(&self, epoch: u64, bytes: usize) {
        self.flow.flushed(epoch, bytes);
    }

    fn transport(&self) -> Result<&AssetTransport, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id()));
        }
        self.transport
            .get()
            .ok_or_else(|| SessionError::NotReady(self.id()))
    }

    /// Write client input. A failed write ends the session.
    pub async fn write_input(&self, data: Bytes) -> Result<(), SessionError> {
        let transport = self.transport()?;
        if let Err(e) = transport.write(data).await {
            self.fail(&e).await;
            return Err(e.into());
        }
        self.touch();
        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let transport = self.transport()?;
        debug!("Session {} resize {}x{}", self.id(), cols, rows);
        transport.resize(cols, rows).await?;
        Ok(())
    }

    /// Client-requested pause
    pub fn set_paused(&self, paused: bool) {
        debug!("Session {} explicit pause = {}", self.id(), paused);
        self.flow.set_paused(paused);
    }

    /// Last `lines` lines of output as plain text, capped at the configured maximum
    pub fn recent_output(&self, lines: usize) -> Vec<String> {
        let lines = lines.min(self.max_request_lines);
        self.shared.lock().ring.tail_lines(lines)
    }

    async fn fail(&self, err: &TransportError) {
        warn!("Session {} transport error: {}", self.id(), err);
        self.send_control(ServerMessage::error(err.kind(), err.to_string()));
        self.close(&err.to_string()).await;
    }

    /// End the session; later calls are no-ops
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let sink = {
            let mut shared = self.shared.lock();
            shared.sink.take()
        };
        if let Some(sink) = sink {
            let _ = sink.tx.send(Outbound::Control(ServerMessage::TermClosed {
                reason: reason.to_string(),
            }));
            let _ = sink.tx.send(Outbound::Close(reason.to_string()));
        }

        if let Some(transport) = self.transport.get() {
            transport.close().await;
        }
        info!("Session {} closed: {}", self.id(), reason);
    }

    fn touch(&self) {
        *self.last_active.lock() = Utc::now();
    }

    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    /// Rename an implicitly opened session when the client binds it
    pub(crate) fn set_id(&self, id: impl Into<String>) {
        *self.id.lock() = id.into();
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.shared.lock().sink.is_some()
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if self.transport.get().is_none() {
            SessionState::Connecting
        } else if !self.flow.is_open() {
            SessionState::Paused
        } else {
            SessionState::Active
        }
    }

    /// Detached for at least `grace`
    pub fn is_expired(&self, grace: Duration) -> bool {
        self.detached_at
            .lock()
            .is_some_and(|since| since.elapsed() >= grace)
    }

    pub fn info(&self) -> SessionInfo {
        let (attached, buffered_lines, buffered_bytes) = {
            let shared = self.shared.lock();
            (shared.sink.is_some(), shared.ring.len(), shared.ring.byte_len())
        };
        SessionInfo {
            id: self.id(),
            asset_id: self.asset_id.clone(),
            state: self.state(),
            attached,
            buffered_lines,
            buffered_bytes,
            created_at: self.created_at,
            last_active_at: *self.last_active.lock(),
        }
    }
}
