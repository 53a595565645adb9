//! Terminal WebSocket Server
//!
//! One WebSocket per terminal at `/terminal/{asset_id}?cols=&rows=`.
//!
//! Each connection runs two tasks:
//!
//! - the reader (this connection's task) decodes client frames and applies
//!   them to the session in arrival order, and drives the ping heartbeat and
//!   read deadline;
//! - the writer owns the socket sink. It drains the session attachment,
//!   reports flushed bytes back to the flow gate, and interleaves frames the
//!   reader sends directly (pings, bind acks).
//!
//! Binding: the first frame decides. `TermSetSessionId` reattaches to (or
//! opens) the session under that id; anything else, or silence for
//! `session_bind_timeout`, opens an unbound session. Unbound sessions die
//! with their WebSocket; bound ones are detached and wait out the reconnect
//! grace period in the [`SessionRegistry`].

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{decode, ClientMessage, Inbound, ServerMessage};
use super::BridgeError;
use crate::asset::{Asset, AssetStore};
use crate::config::{SessionConfig, WsConfig};
use crate::session::{Attachment, Outbound, SessionError, SessionRegistry, TerminalSession};
use crate::transport::TransportOpener;

/// WebSocket handshake must finish within this window
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Parsed `/terminal/{asset_id}?cols=&rows=` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRequest {
    pub asset_id: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl TerminalRequest {
    pub fn parse(path: &str, query: Option<&str>) -> Option<Self> {
        let asset_id = path.strip_prefix("/terminal/")?.trim_end_matches('/');
        if asset_id.is_empty() || asset_id.contains('/') {
            return None;
        }

        let mut request = TerminalRequest {
            asset_id: asset_id.to_string(),
            cols: None,
            rows: None,
        };
        for pair in query.unwrap_or_default().split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.parse::<u16>().ok().filter(|n| *n > 0);
            match key {
                "cols" => request.cols = value,
                "rows" => request.rows = value,
                _ => {}
            }
        }
        Some(request)
    }
}

pub struct TerminalServer {
    ws: WsConfig,
    session: SessionConfig,
    assets: Arc<dyn AssetStore>,
    registry: Arc<SessionRegistry>,
    opener: Arc<dyn TransportOpener>,
}

impl TerminalServer {
    pub fn new(
        ws: WsConfig,
        session: SessionConfig,
        assets: Arc<dyn AssetStore>,
        registry: Arc<SessionRegistry>,
        opener: Arc<dyn TransportOpener>,
    ) -> Self {
        Self {
            ws,
            session,
            assets,
            registry,
            opener,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        TcpListener::bind(&self.ws.listen)
            .await
            .map_err(|e| BridgeError::Bind(format!("{}: {}", self.ws.listen, e)))
    }

    /// Accept loop; runs until `cancel` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Terminal server listening on ws://{}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let server = self.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer, cancel).await {
                            debug!("Terminal connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Terminal listener accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        info!("Terminal server stopped");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let mut request = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match TerminalRequest::parse(req.uri().path(), req.uri().query()) {
                Some(parsed) => {
                    request = Some(parsed);
                    Ok(response)
                }
                None => {
                    let mut error = ErrorResponse::new(Some("expected /terminal/{asset_id}".into()));
                    *error.status_mut() = StatusCode::NOT_FOUND;
                    Err(error)
                }
            }
        };
        let mut ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback))
            .await
            .map_err(|_| BridgeError::Handshake("timeout".into()))?
            .map_err(|e| BridgeError::Handshake(e.to_string()))?;
        let request = request.ok_or_else(|| BridgeError::Handshake("no request path".into()))?;
        debug!("Terminal WebSocket from {} for asset {}", peer, request.asset_id);

        let asset = match self.assets.get_asset(&request.asset_id).await {
            Ok(Some(asset)) => asset,
            Ok(None) => {
                reject(&mut ws, ServerMessage::error("not_found", format!("asset {} not found", request.asset_id))).await;
                return Err(BridgeError::AssetNotFound(request.asset_id));
            }
            Err(e) => {
                reject(&mut ws, ServerMessage::error("unavailable", e.to_string())).await;
                return Err(BridgeError::Handshake(e.to_string()));
            }
        };
        let cols = request.cols.unwrap_or(self.session.default_cols);
        let rows = request.rows.unwrap_or(self.session.default_rows);

        let (sink, mut source) = ws.split();
        let opening = first_frame(&mut source, self.ws.session_bind_timeout()).await;

        let (session, bound, reattached, pending) = match opening {
            Opening::Gone => return Ok(()),
            Opening::Bind(id) => {
                let (session, reattached) = match self.bound_session(&id, &asset, cols, rows).await {
                    Ok(found) => found,
                    Err(e) => return fail_open(sink, source, &e).await,
                };
                (session, true, reattached, None)
            }
            Opening::Implicit(pending) => {
                let id = Uuid::new_v4().to_string();
                match self.open_session(id, &asset, cols, rows).await {
                    Ok(session) => (session, false, false, pending),
                    Err(e) => return fail_open(sink, source, &e).await,
                }
            }
        };

        let attachment = match session.attach() {
            Ok(attachment) => attachment,
            Err(e) => return fail_open(sink, source, &e).await,
        };

        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let done = cancel.child_token();

        let mut conn = Connection {
            registry: self.registry.clone(),
            session,
            epoch: attachment.epoch,
            bound,
            attach_tx,
            direct_tx,
        };
        if bound {
            conn.ack(reattached, attachment.replay_bytes);
        }
        let _ = conn.attach_tx.send((conn.session.clone(), attachment));

        let writer = tokio::spawn(write_loop(
            sink,
            attach_rx,
            direct_rx,
            self.ws.send_timeout(),
            done.clone(),
        ));

        if let Some(message) = pending {
            conn.dispatch(message).await;
        }
        self.read_loop(&mut conn, &mut source, &done).await;

        done.cancel();
        if conn.bound {
            conn.session.detach(conn.epoch);
        } else {
            conn.session.close("client disconnected").await;
        }
        let _ = writer.await;
        info!("Terminal WebSocket for session {} closed", conn.session.id());
        Ok(())
    }

    async fn read_loop(&self, conn: &mut Connection, source: &mut WsSource, done: &CancellationToken) {
        let read_timeout = self.ws.read_timeout();
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.ws.ping_interval(),
            self.ws.ping_interval(),
        );
        let deadline = tokio::time::sleep(read_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = &mut deadline => {
                    warn!("Session {}: no traffic for {:?}, dropping WebSocket", conn.session.id(), read_timeout);
                    break;
                }
                _ = heartbeat.tick() => {
                    let _ = conn.direct_tx.send(Message::Ping(Vec::new()));
                }
                message = source.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            debug!("Session {} WebSocket receive error: {}", conn.session.id(), e);
                            break;
                        }
                        None => break,
                    };
                    deadline.as_mut().reset(Instant::now() + read_timeout);
                    if !conn.dispatch(message).await {
                        break;
                    }
                }
            }
        }
    }

    /// Existing live session under `id`, or a fresh one registered under it.
    /// An existing session must belong to the same asset.
    async fn bound_session(
        &self,
        id: &str,
        asset: &Asset,
        cols: u16,
        rows: u16,
    ) -> Result<(Arc<TerminalSession>, bool), SessionError> {
        if let Some(existing) = self.registry.get(id) {
            return same_asset(existing, &asset.id).map(|s| (s, true));
        }

        let session = self.open_session(id.to_string(), asset, cols, rows).await?;
        match self.registry.insert(session.clone()) {
            Ok(()) => Ok((session, false)),
            Err(e) => {
                // Lost a race with another connection binding the same id
                session.close("session id taken").await;
                let existing = self.registry.get(id).ok_or(e)?;
                same_asset(existing, &asset.id).map(|s| (s, true))
            }
        }
    }

    async fn open_session(
        &self,
        id: String,
        asset: &Asset,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<TerminalSession>, SessionError> {
        let session = TerminalSession::new(id, asset.id.clone(), &self.session);
        let opened = self.opener.open(asset, cols, rows).await.map_err(|e| {
            warn!("Failed to open terminal on asset {}: {}", asset.id, e);
            e
        })?;
        session.start(opened)?;
        Ok(session)
    }
}

enum Opening {
    /// Client left before saying anything
    Gone,
    Bind(String),
    /// Open unbound; the frame (if any) is dispatched to the new session
    Implicit(Option<Message>),
}

async fn first_frame(source: &mut WsSource, window: Duration) -> Opening {
    let deadline = Instant::now() + window;
    loop {
        let message = match tokio::time::timeout_at(deadline, source.next()).await {
            Err(_) => return Opening::Implicit(None),
            Ok(None) | Ok(Some(Err(_))) => return Opening::Gone,
            Ok(Some(Ok(message))) => message,
        };
        match message {
            Message::Close(_) => return Opening::Gone,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            Message::Text(text) => {
                if let Ok(Inbound::Message(ClientMessage::TermSetSessionId { session_id })) = decode(&text) {
                    if !session_id.is_empty() {
                        return Opening::Bind(session_id);
                    }
                }
                return Opening::Implicit(Some(Message::Text(text)));
            }
            Message::Binary(data) => return Opening::Implicit(Some(Message::Binary(data))),
        }
    }
}

fn close_frame(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Owned(reason.to_string()),
    }))
}

async fn reject(ws: &mut WsStream, error: ServerMessage) {
    let _ = ws.send(Message::Text(error.to_json())).await;
    let _ = ws.send(close_frame("rejected")).await;
}

fn same_asset(
    session: Arc<TerminalSession>,
    asset_id: &str,
) -> Result<Arc<TerminalSession>, SessionError> {
    if session.asset_id() == asset_id {
        Ok(session)
    } else {
        Err(SessionError::AssetMismatch {
            id: session.id(),
            asset: session.asset_id().to_string(),
        })
    }
}

async fn fail_open(sink: WsSink, source: WsSource, err: &SessionError) -> Result<(), BridgeError> {
    if let Ok(mut ws) = sink.reunite(source) {
        reject(&mut ws, ServerMessage::error(err.kind(), err.to_string())).await;
    }
    Err(BridgeError::Open(err.to_string()))
}

/// Reader-side state of one WebSocket
struct Connection {
    registry: Arc<SessionRegistry>,
    session: Arc<TerminalSession>,
    epoch: u64,
    bound: bool,
    attach_tx: mpsc::UnboundedSender<(Arc<TerminalSession>, Attachment)>,
    direct_tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    fn send(&self, message: ServerMessage) {
        let _ = self.direct_tx.send(Message::Text(message.to_json()));
    }

    fn ack(&self, reattached: bool, replay_bytes: usize) {
        self.send(ServerMessage::TermSessionBound {
            session_id: self.session.id(),
            reattached,
            replay_bytes,
        });
    }

    /// Apply one client frame. Returns false when the connection should end.
    async fn dispatch(&mut self, message: Message) -> bool {
        match message {
            Message::Binary(data) => self.input(Bytes::from(data)).await,
            Message::Text(text) => match decode(&text) {
                Ok(Inbound::Message(message)) => self.handle(message).await,
                Ok(Inbound::Unknown(kind)) => {
                    debug!("Session {}: ignoring unknown message type {}", self.session.id(), kind);
                }
                Err(e) => {
                    warn!("Session {}: dropping frame: {}", self.session.id(), e);
                }
            },
            Message::Close(_) => return false,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
        true
    }

    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::TermSetSessionId { session_id } => self.bind(session_id).await,
            ClientMessage::TermResize { rows, cols } => {
                if let Err(e) = self.session.resize(cols, rows).await {
                    warn!("Session {} resize failed: {}", self.session.id(), e);
                }
            }
            ClientMessage::TermInput { data } => self.input(Bytes::from(data)).await,
            ClientMessage::TermPause { pause } => self.session.set_paused(pause),
            ClientMessage::TermOutputRequest { request_id, lines } => {
                // Through the attachment so it lands after output already queued
                self.session.send_control(ServerMessage::TermOutputResponse {
                    request_id,
                    success: true,
                    output: self.session.recent_output(lines),
                    error: None,
                });
            }
        }
    }

    async fn input(&self, data: Bytes) {
        if let Err(e) = self.session.write_input(data).await {
            debug!("Session {} input rejected: {}", self.session.id(), e);
        }
    }

    async fn bind(&mut self, id: String) {
        if id.is_empty() {
            self.send(ServerMessage::error("invalid", "session_id must not be empty"));
            return;
        }
        if self.bound {
            if id == self.session.id() {
                self.ack(true, 0);
            } else {
                self.send(ServerMessage::error(
                    "conflict",
                    format!("connection is bound to session {}", self.session.id()),
                ));
            }
            return;
        }

        // Switch to a live session already known under this id
        if let Some(existing) = self.registry.get(&id) {
            let existing = match same_asset(existing, self.session.asset_id()) {
                Ok(existing) => existing,
                Err(e) => {
                    self.send(ServerMessage::error(e.kind(), e.to_string()));
                    return;
                }
            };
            if let Ok(attachment) = existing.attach() {
                let implicit = std::mem::replace(&mut self.session, existing);
                let implicit_epoch = std::mem::replace(&mut self.epoch, attachment.epoch);
                self.bound = true;
                self.ack(true, attachment.replay_bytes);
                let _ = self.attach_tx.send((self.session.clone(), attachment));
                implicit.detach(implicit_epoch);
                implicit.close("replaced by reattached session").await;
                return;
            }
        }

        let previous = self.session.id();
        self.session.set_id(id);
        match self.registry.insert(self.session.clone()) {
            Ok(()) => {
                self.bound = true;
                self.ack(false, 0);
            }
            Err(e) => {
                self.session.set_id(previous);
                self.send(ServerMessage::error(SessionError::kind(&e), e.to_string()));
            }
        }
    }
}

enum Step {
    Direct(Message),
    Switch(Arc<TerminalSession>, Attachment),
    Frame(Option<Outbound>),
    Stop,
}

async fn next_outbound(current: &mut Option<(Arc<TerminalSession>, Attachment)>) -> Option<Outbound> {
    match current {
        Some((_, attachment)) => attachment.rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut attach_rx: mpsc::UnboundedReceiver<(Arc<TerminalSession>, Attachment)>,
    mut direct_rx: mpsc::UnboundedReceiver<Message>,
    send_timeout: Duration,
    done: CancellationToken,
) {
    let mut current: Option<(Arc<TerminalSession>, Attachment)> = None;

    loop {
        let step = tokio::select! {
            biased;
            _ = done.cancelled() => Step::Stop,
            Some(message) = direct_rx.recv() => Step::Direct(message),
            Some((session, attachment)) = attach_rx.recv() => Step::Switch(session, attachment),
            frame = next_outbound(&mut current) => Step::Frame(frame),
        };

        let (message, flushed) = match step {
            Step::Stop => break,
            Step::Direct(message) => (message, 0),
            Step::Switch(session, attachment) => {
                current = Some((session, attachment));
                continue;
            }
            Step::Frame(Some(Outbound::Output(chunk))) => {
                let len = chunk.len();
                (Message::Binary(chunk.to_vec()), len)
            }
            Step::Frame(Some(Outbound::Control(control))) => (Message::Text(control.to_json()), 0),
            Step::Frame(Some(Outbound::Close(reason))) => {
                let _ = tokio::time::timeout(send_timeout, sink.send(close_frame(&reason))).await;
                break;
            }
            Step::Frame(None) => match attach_rx.try_recv() {
                Ok(next) => {
                    current = Some(next);
                    continue;
                }
                Err(_) => break,
            },
        };

        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {
                if flushed > 0 {
                    if let Some((session, attachment)) = &current {
                        session.flushed(attachment.epoch, flushed);
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("WebSocket send failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("WebSocket send timeout after {:?} - client unresponsive, disconnecting", send_timeout);
                break;
            }
        }
    }

    done.cancel();
    debug!("WebSocket writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::MemoryAssetStore;
    use crate::transport::loopback::LoopbackOpener;
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        opener: Arc<LoopbackOpener>,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn start() -> Self {
            let ws = WsConfig {
                session_bind_timeout_ms: 200,
                ..Default::default()
            };
            let assets = Arc::new(MemoryAssetStore::with_assets([
                Asset::local("laptop"),
                Asset::local("desktop"),
                Asset::local("down-box"),
            ]));
            let registry = Arc::new(SessionRegistry::new(Duration::from_secs(30)));
            let opener = Arc::new(LoopbackOpener::new(64));
            let server = Arc::new(TerminalServer::new(
                ws,
                SessionConfig::default(),
                assets,
                registry.clone(),
                opener.clone(),
            ));
            let listener = server.bind().await.unwrap();
            let addr = listener.local_addr().unwrap();
            let cancel = CancellationToken::new();
            tokio::spawn(server.serve(listener, cancel.clone()));
            Self {
                addr,
                registry,
                opener,
                cancel,
            }
        }

        async fn connect(&self, path: &str) -> Client {
            let (client, _) = connect_async(format!("ws://{}{}", self.addr, path))
                .await
                .unwrap();
            client
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn send_json(client: &mut Client, json: &str) {
        client.send(Message::Text(json.to_string())).await.unwrap();
    }

    async fn next_message(client: &mut Client) -> Message {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection ended")
                .unwrap();
            if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
                return message;
            }
        }
    }

    async fn next_json(client: &mut Client) -> serde_json::Value {
        match next_message(client).await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    /// Read binary output until it contains `needle`; any text frame fails
    async fn read_output_until(client: &mut Client, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match next_message(client).await {
                Message::Binary(data) => seen.push_str(&String::from_utf8_lossy(&data)),
                other => panic!("unexpected frame {:?} while waiting for {:?}", other, needle),
            }
        }
        seen
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_parse_request_path() {
        assert_eq!(
            TerminalRequest::parse("/terminal/db", Some("cols=120&rows=40")),
            Some(TerminalRequest {
                asset_id: "db".into(),
                cols: Some(120),
                rows: Some(40),
            })
        );
        let bare = TerminalRequest::parse("/terminal/db/", None).unwrap();
        assert_eq!(bare.asset_id, "db");
        assert_eq!(bare.cols, None);

        assert!(TerminalRequest::parse("/terminal/", None).is_none());
        assert!(TerminalRequest::parse("/other/db", None).is_none());
        assert_eq!(
            TerminalRequest::parse("/terminal/db", Some("cols=0&rows=x")).unwrap().rows,
            None
        );
    }

    #[tokio::test]
    async fn test_echo_and_output_request() {
        let harness = Harness::start().await;
        let mut client = harness.connect("/terminal/laptop?cols=100&rows=30").await;

        send_json(&mut client, r#"{"type":"TermInput","data":"echo hi\n"}"#).await;
        let output = read_output_until(&mut client, "hi\r\n").await;
        assert!(output.starts_with("echo hi\n"));

        send_json(&mut client, r#"{"type":"TermOutputRequest","request_id":"r1","lines":10}"#).await;
        let response = next_json(&mut client).await;
        assert_eq!(response["type"], "TermOutputResponse");
        assert_eq!(response["request_id"], "r1");
        assert_eq!(response["success"], true);
        let lines: Vec<String> = serde_json::from_value(response["output"].clone()).unwrap();
        assert_eq!(lines, vec!["echo hi", "hi"]);

        // The request was answered from the buffer, not by the shell
        assert_eq!(harness.opener.opened(), 1);
        let handle = harness.opener.last().unwrap();
        assert_eq!(handle.resizes.lock().first(), Some(&(100, 30)));
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let harness = Harness::start().await;
        let mut client = harness.connect("/terminal/laptop").await;

        send_json(&mut client, r#"{"type":"Bogus"}"#).await;
        send_json(&mut client, r#"{"type":"TermInput","data":"echo ok\n"}"#).await;
        // Only output frames arrive: no reply to the bogus frame
        read_output_until(&mut client, "ok\r\n").await;

        send_json(&mut client, r#"{"type":"TermResize","rows":50,"cols":160}"#).await;
        let handle = harness.opener.last().unwrap();
        wait_until(|| handle.resizes.lock().last() == Some(&(160, 50))).await;
    }

    #[tokio::test]
    async fn test_binary_frames_are_input() {
        let harness = Harness::start().await;
        let mut client = harness.connect("/terminal/laptop").await;
        client
            .send(Message::Binary(b"echo raw\n".to_vec()))
            .await
            .unwrap();
        read_output_until(&mut client, "raw\r\n").await;
    }

    #[tokio::test]
    async fn test_reconnect_replays_buffer() {
        let harness = Harness::start().await;

        let mut first = harness.connect("/terminal/laptop").await;
        send_json(&mut first, r#"{"type":"TermSetSessionId","session_id":"S"}"#).await;
        let bound = next_json(&mut first).await;
        assert_eq!(bound["type"], "TermSessionBound");
        assert_eq!(bound["reattached"], false);

        send_json(&mut first, r#"{"type":"TermInput","data":"echo one\n"}"#).await;
        read_output_until(&mut first, "one\r\n").await;
        first.close(None).await.unwrap();

        let registry = harness.registry.clone();
        wait_until(|| registry.get("S").is_some_and(|s| !s.is_attached())).await;

        let mut second = harness.connect("/terminal/laptop").await;
        send_json(&mut second, r#"{"type":"TermSetSessionId","session_id":"S"}"#).await;
        let bound = next_json(&mut second).await;
        assert_eq!(bound["reattached"], true);
        let replay_bytes = bound["replay_bytes"].as_u64().unwrap() as usize;

        let replay = match next_message(&mut second).await {
            Message::Binary(data) => data,
            other => panic!("expected replay, got {:?}", other),
        };
        assert_eq!(replay.len(), replay_bytes);
        assert_eq!(replay, b"echo one\none\r\n".to_vec());

        send_json(&mut second, r#"{"type":"TermInput","data":"echo two\n"}"#).await;
        let live = read_output_until(&mut second, "two\r\n").await;
        assert!(!live.contains("one"));
        assert_eq!(harness.opener.opened(), 1);
    }

    #[tokio::test]
    async fn test_late_bind_switches_to_existing_session() {
        let harness = Harness::start().await;

        let mut first = harness.connect("/terminal/laptop").await;
        send_json(&mut first, r#"{"type":"TermSetSessionId","session_id":"S"}"#).await;
        next_json(&mut first).await;
        send_json(&mut first, r#"{"type":"TermInput","data":"echo kept\n"}"#).await;
        read_output_until(&mut first, "kept\r\n").await;
        first.close(None).await.unwrap();
        let registry = harness.registry.clone();
        wait_until(|| registry.get("S").is_some_and(|s| !s.is_attached())).await;

        // Unbound at first, then asks for S
        let mut second = harness.connect("/terminal/laptop").await;
        send_json(&mut second, r#"{"type":"TermPause","pause":false}"#).await;
        wait_until(|| harness.opener.opened() == 2).await;
        let implicit = harness.opener.last().unwrap();

        send_json(&mut second, r#"{"type":"TermSetSessionId","session_id":"S"}"#).await;
        let bound = next_json(&mut second).await;
        assert_eq!(bound["session_id"], "S");
        assert_eq!(bound["reattached"], true);
        read_output_until(&mut second, "kept\r\n").await;
        wait_until(|| implicit.is_closed()).await;
    }

    #[tokio::test]
    async fn test_session_of_another_asset_is_refused() {
        let harness = Harness::start().await;

        let mut owner = harness.connect("/terminal/laptop").await;
        send_json(&mut owner, r#"{"type":"TermSetSessionId","session_id":"S"}"#).await;
        assert_eq!(next_json(&mut owner).await["type"], "TermSessionBound");

        // Bind as the first frame
        let mut intruder = harness.connect("/terminal/desktop").await;
        send_json(&mut intruder, r#"{"type":"TermSetSessionId","session_id":"S"}"#).await;
        let error = next_json(&mut intruder).await;
        assert_eq!(error["type"], "TermError");
        assert_eq!(error["kind"], "conflict");
        assert!(matches!(next_message(&mut intruder).await, Message::Close(_)));

        // Bind after an implicit session was opened
        let mut late = harness.connect("/terminal/desktop").await;
        send_json(&mut late, r#"{"type":"TermPause","pause":false}"#).await;
        send_json(&mut late, r#"{"type":"TermSetSessionId","session_id":"S"}"#).await;
        let error = next_json(&mut late).await;
        assert_eq!(error["kind"], "conflict");

        // The implicit session keeps working and S stays with its owner
        send_json(&mut late, r#"{"type":"TermInput","data":"echo mine\n"}"#).await;
        read_output_until(&mut late, "mine\r\n").await;
        let session = harness.registry.get("S").unwrap();
        assert_eq!(session.asset_id(), "laptop");
        assert!(session.is_attached());
    }

    #[tokio::test]
    async fn test_unbound_session_dies_with_socket() {
        let harness = Harness::start().await;
        let mut client = harness.connect("/terminal/laptop").await;
        send_json(&mut client, r#"{"type":"TermInput","data":"echo x\n"}"#).await;
        read_output_until(&mut client, "x\r\n").await;
        assert!(harness.registry.is_empty());

        client.close(None).await.unwrap();
        let handle = harness.opener.last().unwrap();
        wait_until(|| handle.is_closed()).await;
    }

    #[tokio::test]
    async fn test_missing_asset_is_rejected() {
        let harness = Harness::start().await;
        let mut client = harness.connect("/terminal/nope").await;
        let error = next_json(&mut client).await;
        assert_eq!(error["type"], "TermError");
        assert_eq!(error["kind"], "not_found");
        assert!(matches!(next_message(&mut client).await, Message::Close(_)));
        assert_eq!(harness.opener.opened(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let harness = Harness::start().await;
        let mut client = harness.connect("/terminal/down-box").await;
        send_json(&mut client, r#"{"type":"TermSetSessionId","session_id":"D"}"#).await;
        let error = next_json(&mut client).await;
        assert_eq!(error["kind"], "connection_refused");
        assert!(harness.registry.get("D").is_none());
    }

    #[tokio::test]
    async fn test_shell_exit_closes_socket() {
        let harness = Harness::start().await;
        let mut client = harness.connect("/terminal/laptop").await;
        send_json(&mut client, r#"{"type":"TermSetSessionId","session_id":"E"}"#).await;
        next_json(&mut client).await;

        let handle = harness.opener.last().unwrap();
        handle
            .out_tx
            .send(crate::transport::TransportEvent::Exited(Some(0)))
            .await
            .unwrap();
        let closed = next_json(&mut client).await;
        assert_eq!(closed["type"], "TermClosed");
        assert!(matches!(next_message(&mut client).await, Message::Close(_)));
    }
}
