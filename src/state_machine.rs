//! Session state machine: Idle → Requesting → Streaming → Completed | Cancelled | Failed.
//! Only the most recent session is tracked; updates from a superseded session
//! are rejected as stale.

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionPhase {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "Idle"),
            SessionPhase::Requesting => write!(f, "Requesting"),
            SessionPhase::Streaming => write!(f, "Streaming"),
            SessionPhase::Completed => write!(f, "Completed"),
            SessionPhase::Cancelled => write!(f, "Cancelled"),
            SessionPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Idle | Completed | Cancelled | Failed, Requesting)
                | (Requesting, Streaming)
                | (Requesting, Cancelled)
                | (Requesting, Failed)
                | (Streaming, Completed)
                | (Streaming, Cancelled)
                | (Streaming, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session: u64,
    pub phase: SessionPhase,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {from} -> {to}")]
    Invalid { from: SessionPhase, to: SessionPhase },
    #[error("session {session} is stale (current is {current})")]
    Stale { session: u64, current: u64 },
}

/// Phase of the latest session, observable through a watch channel.
pub struct SessionTracker {
    status: RwLock<SessionStatus>,
    tx: watch::Sender<SessionStatus>,
}

impl SessionTracker {
    pub fn new() -> Self {
        let initial = SessionStatus {
            session: 0,
            phase: SessionPhase::Idle,
        };
        let (tx, _) = watch::channel(initial);
        Self {
            status: RwLock::new(initial),
            tx,
        }
    }

    pub fn current(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Start tracking a new session in `Requesting`. The previous session
    /// must already have reached a terminal phase.
    pub fn begin(&self, session: u64) -> Result<SessionStatus, TransitionError> {
        let mut status = self.status.write();
        if !status.phase.can_transition_to(SessionPhase::Requesting) {
            warn!(current = status.session, phase = %status.phase, "session begin rejected");
            return Err(TransitionError::Invalid {
                from: status.phase,
                to: SessionPhase::Requesting,
            });
        }
        *status = SessionStatus {
            session,
            phase: SessionPhase::Requesting,
        };
        self.tx.send_replace(*status);
        debug!(session, "session_begin");
        Ok(*status)
    }

    pub fn transition(
        &self,
        session: u64,
        next: SessionPhase,
    ) -> Result<SessionPhase, TransitionError> {
        let mut status = self.status.write();
        if status.session != session {
            return Err(TransitionError::Stale {
                session,
                current: status.session,
            });
        }
        let current = status.phase;
        if !current.can_transition_to(next) {
            warn!(session, from = %current, to = %next, "invalid session transition");
            return Err(TransitionError::Invalid {
                from: current,
                to: next,
            });
        }
        status.phase = next;
        self.tx.send_replace(*status);
        debug!(session, from = %current, to = %next, "session_transition");
        Ok(next)
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}
