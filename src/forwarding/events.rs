//! Tunnel Event System
//!
//! Fire-and-forget notifications published after each tunnel state
//! transition. Delivery is never awaited by the manager.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::manager::TunnelStatus;

/// Tunnel event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    Created {
        tunnel_id: String,
        asset_id: String,
    },
    StatusChanged {
        tunnel_id: String,
        asset_id: String,
        status: TunnelStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Deleted {
        tunnel_id: String,
        asset_id: String,
    },
}

impl TunnelEvent {
    pub fn tunnel_id(&self) -> &str {
        match self {
            TunnelEvent::Created { tunnel_id, .. }
            | TunnelEvent::StatusChanged { tunnel_id, .. }
            | TunnelEvent::Deleted { tunnel_id, .. } => tunnel_id,
        }
    }
}

/// Sink for tunnel events
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: TunnelEvent);
}

/// Drops everything (embedding without a notification bus)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: TunnelEvent) {}
}

/// Publishes on a tokio broadcast channel; lagging receivers lose events
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    tx: broadcast::Sender<TunnelEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl EventEmitter for BroadcastEmitter {
    fn emit(&self, event: TunnelEvent) {
        if self.tx.send(event).is_err() {
            trace!("No tunnel event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_emitter() {
        // Should not panic
        NoopEmitter.emit(TunnelEvent::Deleted {
            tunnel_id: "t-1".into(),
            asset_id: "a-1".into(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = TunnelEvent::StatusChanged {
            tunnel_id: "t-1".into(),
            asset_id: "a-1".into(),
            status: TunnelStatus::Error,
            error: Some("SSH connection lost".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"statusChanged\""));
        assert!(json.contains("\"status\":\"error\""));
        assert_eq!(event.tunnel_id(), "t-1");
    }

    #[tokio::test]
    async fn test_broadcast_emitter_delivers() {
        let emitter = BroadcastEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(TunnelEvent::Created {
            tunnel_id: "t-2".into(),
            asset_id: "a-1".into(),
        });
        assert_eq!(rx.recv().await.unwrap().tunnel_id(), "t-2");
    }
}
