use crate::types::SessionId;
use serde::Serialize;
use std::fmt;

/// Why an inbound message was discarded without touching the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    StaleSession {
        expected: Option<SessionId>,
        got: SessionId,
    },
    UnrecognizedStep {
        step_id: String,
    },
    NoActiveTurn,
    MissingProvider {
        step_id: String,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleSession { expected, got } => match expected {
                Some(e) => write!(f, "stale session {} (active {})", got, e),
                None => write!(f, "stale session {} (no active session)", got),
            },
            Self::UnrecognizedStep { step_id } => write!(f, "unrecognized step '{}'", step_id),
            Self::NoActiveTurn => write!(f, "no active turn"),
            Self::MissingProvider { step_id } => {
                write!(f, "step '{}' carries no provider result", step_id)
            }
        }
    }
}

/// Filters protocol messages by session id.
#[derive(Debug, Default, Clone)]
pub struct SessionGuard {
    active: Option<SessionId>,
}

impl SessionGuard {
    pub fn new(active: Option<SessionId>) -> Self {
        Self { active }
    }

    pub fn active(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    pub fn admit(&self, session_id: &SessionId) -> Result<(), DropReason> {
        if self.active.as_ref() == Some(session_id) {
            return Ok(());
        }
        let reason = DropReason::StaleSession {
            expected: self.active.clone(),
            got: session_id.clone(),
        };
        tracing::warn!("[GUARD] Discarding message: {}", reason);
        Err(reason)
    }

    /// Adopts a backend-assigned id. Only a dispatch that went out without a
    /// session may claim one; any other `SESSION_STARTED` belongs to an abandoned
    /// request. Returns `Ok(false)` when `session_id` is already the active one.
    pub fn adopt(&mut self, session_id: &SessionId, awaiting: bool) -> Result<bool, DropReason> {
        if self.active.as_ref() == Some(session_id) {
            return Ok(false);
        }
        if self.active.is_none() && awaiting {
            tracing::info!("[GUARD] Adopting session {}", session_id.short());
            self.active = Some(session_id.clone());
            return Ok(true);
        }
        let reason = DropReason::StaleSession {
            expected: self.active.clone(),
            got: session_id.clone(),
        };
        tracing::warn!("[GUARD] Refusing SESSION_STARTED: {}", reason);
        Err(reason)
    }

    pub fn switch_to(&mut self, session_id: Option<SessionId>) {
        self.active = session_id;
    }
}
