//! Session Registry
//!
//! Keyed store of bound terminal sessions. The only shared structure on the
//! terminal side: the bridge adds and looks sessions up here, the sweeper
//! removes the ones whose reconnect grace ran out, and outside consumers
//! read output through [`SessionRegistry::get_recent_output`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::terminal::{SessionInfo, TerminalSession};
use super::SessionError;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<TerminalSession>>,
    grace: Duration,
}

impl SessionRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            grace,
        }
    }

    /// Register `session` under its id. A closed session holding the id is
    /// replaced; a live one is not.
    pub fn insert(&self, session: Arc<TerminalSession>) -> Result<(), SessionError> {
        let id = session.id();
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_closed() {
                    return Err(SessionError::IdInUse(id));
                }
                existing.insert(session);
            }
            Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }
        debug!("Session {} registered", id);
        Ok(())
    }

    /// Live session by id
    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_closed())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Read-only view of a session's output for tooling
    pub fn get_recent_output(&self, id: &str, max_lines: usize) -> Result<Vec<String>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().recent_output(max_lines))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Close and drop sessions that are closed already or were detached for
    /// longer than the grace period. Returns the removed ids.
    pub async fn sweep_expired(&self) -> Vec<String> {
        // Collect first: no map guard may be held across an await
        let expired: Vec<(String, Arc<TerminalSession>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_closed() || entry.value().is_expired(self.grace))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for (id, session) in expired {
            // Re-check under the entry: the client may have come back
            let gone = self
                .sessions
                .remove_if(&id, |_, s| {
                    Arc::ptr_eq(s, &session) && (s.is_closed() || s.is_expired(self.grace))
                })
                .is_some();
            if gone {
                session.close("reconnect grace period expired").await;
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            info!("Swept {} expired session(s)", removed.len());
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_expired().await;
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    /// Close every session (shutdown)
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<TerminalSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.close("engine shutting down").await;
        }
    }
}
