//! In-process transport for session and bridge tests
//!
//! Behaves like a tiny shell: input is echoed back, and every complete
//! `echo <text>` line also prints `<text>`. Tests drive raw output bursts
//! through the [`LoopbackHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{AssetTransport, OpenedTransport, TransportError, TransportEvent, TransportOpener};
use crate::asset::Asset;

pub(crate) struct Loopback {
    out_tx: mpsc::Sender<TransportEvent>,
    line: Mutex<Vec<u8>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    closed: Arc<AtomicBool>,
}

#[derive(Clone)]
pub(crate) struct LoopbackHandle {
    pub(crate) out_tx: mpsc::Sender<TransportEvent>,
    pub(crate) resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl LoopbackHandle {
    pub(crate) async fn emit(&self, data: &[u8]) {
        let _ = self
            .out_tx
            .send(TransportEvent::Data(Bytes::copy_from_slice(data)))
            .await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Loopback {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>, LoopbackHandle) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let handle = LoopbackHandle {
            out_tx: out_tx.clone(),
            resizes: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let transport = Self {
            out_tx,
            line: Mutex::new(Vec::new()),
            resizes: handle.resizes.clone(),
            closed: handle.closed.clone(),
        };
        (transport, out_rx, handle)
    }

    pub(crate) async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut replies = vec![data.clone()];
        {
            let mut line = self.line.lock();
            for &byte in data.iter() {
                if byte == b'\n' {
                    let text = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
                    if let Some(arg) = text.strip_prefix("echo ") {
                        replies.push(Bytes::from(format!("{}\r\n", arg)));
                    }
                    line.clear();
                } else {
                    line.push(byte);
                }
            }
        }

        for reply in replies {
            self.out_tx
                .send(TransportEvent::Data(reply))
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    pub(crate) fn resize(&self, cols: u16, rows: u16) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.resizes.lock().push((cols, rows));
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out loopback transports and keeps their handles for inspection.
/// Assets whose id starts with `down` fail to open.
#[derive(Default)]
pub(crate) struct LoopbackOpener {
    capacity: usize,
    opened: Mutex<Vec<(String, LoopbackHandle)>>,
}

impl LoopbackOpener {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    pub(crate) fn last(&self) -> Option<LoopbackHandle> {
        self.opened.lock().last().map(|(_, h)| h.clone())
    }
}

#[async_trait]
impl TransportOpener for LoopbackOpener {
    async fn open(
        &self,
        asset: &Asset,
        cols: u16,
        rows: u16,
    ) -> Result<OpenedTransport, TransportError> {
        if asset.id.starts_with("down") {
            return Err(TransportError::ConnectionRefused(format!(
                "{}: connection refused",
                asset.id
            )));
        }
        let (transport, rx, handle) = Loopback::new(self.capacity);
        handle.resizes.lock().push((cols, rows));
        self.opened.lock().push((asset.id.clone(), handle));
        Ok((AssetTransport::Loopback(transport), rx))
    }
}
