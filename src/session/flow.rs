//! Output flow control
//!
//! The transport reader of a session waits on this gate before taking the
//! next chunk. The gate closes when either
//!
//! - bytes handed to the WebSocket send path but not yet flushed reach the
//!   HIGH watermark (and stay closed until they drain to LOW), or
//! - the client asked for an explicit pause.
//!
//! The unflushed counter belongs to one attachment. Each attach/detach bumps
//! the epoch, and queue/flush reports tagged with an older epoch are dropped,
//! so a dying WebSocket writer can never skew the counter of its successor.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowSnapshot {
    pub epoch: u64,
    pub outbound: usize,
    pub watermark_paused: bool,
    pub explicit_paused: bool,
}

struct FlowState {
    epoch: u64,
    outbound: usize,
    watermark_paused: bool,
    explicit_paused: bool,
}

impl FlowState {
    fn is_open(&self) -> bool {
        !self.watermark_paused && !self.explicit_paused
    }
}

pub struct FlowGate {
    high: usize,
    low: usize,
    state: Mutex<FlowState>,
    open_tx: watch::Sender<bool>,
}

impl FlowGate {
    pub fn new(high: usize, low: usize) -> Self {
        let (open_tx, _) = watch::channel(true);
        Self {
            high,
            low: low.min(high),
            state: Mutex::new(FlowState {
                epoch: 0,
                outbound: 0,
                watermark_paused: false,
                explicit_paused: false,
            }),
            open_tx,
        }
    }

    fn publish(&self, state: &FlowState) {
        let open = state.is_open();
        self.open_tx.send_if_modified(|current| {
            if *current != open {
                *current = open;
                true
            } else {
                false
            }
        });
    }

    /// Start a new attachment: fresh counter, no pause. Returns its epoch.
    pub fn attach(&self) -> u64 {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.outbound = 0;
        state.watermark_paused = false;
        state.explicit_paused = false;
        self.publish(&state);
        state.epoch
    }

    /// End attachment `epoch`. The gate reopens so output keeps flowing into
    /// the ring buffer while nobody is attached.
    pub fn detach(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.epoch += 1;
        state.outbound = 0;
        state.watermark_paused = false;
        state.explicit_paused = false;
        self.publish(&state);
    }

    /// `bytes` were handed to the send path of attachment `epoch`
    pub fn queued(&self, epoch: u64, bytes: usize) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.outbound += bytes;
        if !state.watermark_paused && state.outbound >= self.high {
            state.watermark_paused = true;
            self.publish(&state);
        }
    }

    /// `bytes` of attachment `epoch` reached the socket
    pub fn flushed(&self, epoch: u64, bytes: usize) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.outbound = state.outbound.saturating_sub(bytes);
        if state.watermark_paused && state.outbound <= self.low {
            state.watermark_paused = false;
            self.publish(&state);
        }
    }

    /// Client-requested pause; independent of the watermark
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.explicit_paused = paused;
        self.publish(&state);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        let state = self.state.lock();
        FlowSnapshot {
            epoch: state.epoch,
            outbound: state.outbound,
            watermark_paused: state.watermark_paused,
            explicit_paused: state.explicit_paused,
        }
    }

    /// Resolves once both pause conditions are clear
    pub async fn wait_open(&self) {
        let mut rx = self.open_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Resolves once either pause condition is set
    pub async fn wait_closed(&self) {
        let mut rx = self.open_tx.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }
}
