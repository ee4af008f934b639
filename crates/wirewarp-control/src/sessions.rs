//! Live agent channel sessions
//!
//! At most one session per agent. A newer connection supersedes the older
//! one, and credential rotation or agent deletion cancels the current one.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Handle held by the task serving one agent connection
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub agent_id: Uuid,
    pub session_id: u64,
    pub cancel: CancellationToken,
}

/// Table of agents with a live channel
pub struct AgentSessions {
    sessions: DashMap<Uuid, AgentSession>,
    next_id: AtomicU64,
}

impl AgentSessions {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for an agent, cancelling any previous one
    pub fn register(&self, agent_id: Uuid) -> AgentSession {
        let session = AgentSession {
            agent_id,
            session_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        };

        if let Some(previous) = self.sessions.insert(agent_id, session.clone()) {
            info!(
                agent_id = %agent_id,
                session_id = previous.session_id,
                "Replacing existing agent session"
            );
            previous.cancel.cancel();
        }

        session
    }

    /// Remove a session. Returns false when it was already superseded or
    /// cancelled, in which case the caller must not touch agent status.
    pub fn unregister(&self, session: &AgentSession) -> bool {
        self.sessions
            .remove_if(&session.agent_id, |_, current| {
                current.session_id == session.session_id
            })
            .is_some()
    }

    /// Cancel and forget the agent's live session, if any
    pub fn cancel(&self, agent_id: Uuid) -> bool {
        match self.sessions.remove(&agent_id) {
            Some((_, session)) => {
                info!(agent_id = %agent_id, "Cancelling agent session");
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, agent_id: Uuid) -> bool {
        self.sessions.contains_key(&agent_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for AgentSessions {
    fn default() -> Self {
        Self::new()
    }
}
