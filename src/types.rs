use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::round::IneligibleReason;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(format!("turn_{}", Uuid::new_v4().simple()))
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 13)
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum ChorusError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown turn: {0}")]
    UnknownTurn(String),

    #[error("Provider {provider} is not eligible: {reason}")]
    NotEligible {
        provider: ProviderId,
        reason: IneligibleReason,
    },

    #[error("A workflow is already in flight for turn {0}")]
    WorkflowInFlight(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Kernel unavailable: {0}")]
    KernelClosed(String),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChorusError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChorusError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- RESPONSES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Pending,
    Streaming,
    #[serde(alias = "success")]
    Completed,
    #[serde(alias = "failed")]
    Error,
}

impl ResponseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which of the three buckets on an AI turn a response belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Batch,
    Synthesis,
    Ensemble,
}

impl ResponseKind {
    pub fn is_derived(self) -> bool {
        !matches!(self, Self::Batch)
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Batch => "batch",
            Self::Synthesis => "synthesis",
            Self::Ensemble => "ensemble",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub provider_id: ProviderId,
    pub text: String,
    pub status: ResponseStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderResponse {
    pub fn pending(provider_id: ProviderId, at: DateTime<Utc>) -> Self {
        Self {
            provider_id,
            text: String::new(),
            status: ResponseStatus::Pending,
            created_at: at,
            updated_at: None,
            attempt_number: None,
            meta: None,
            error: None,
        }
    }

    pub fn is_completed_output(&self) -> bool {
        self.status == ResponseStatus::Completed && !self.text.trim().is_empty()
    }
}

/// --- TURNS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTurn {
    pub id: TurnId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

/// Back-reference from a derived turn to the round it was computed from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedOrigin {
    pub user_turn_id: TurnId,
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiTurn {
    pub id: TurnId,
    pub user_turn_id: TurnId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub batch_responses: BTreeMap<ProviderId, ProviderResponse>,
    #[serde(default)]
    pub synthesis_responses: BTreeMap<ProviderId, Vec<ProviderResponse>>,
    #[serde(default)]
    pub ensemble_responses: BTreeMap<ProviderId, Vec<ProviderResponse>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<DerivedOrigin>,
}

impl AiTurn {
    pub fn new(user_turn_id: TurnId, session_id: Option<SessionId>, at: DateTime<Utc>) -> Self {
        Self {
            id: TurnId::new(),
            user_turn_id,
            created_at: at,
            session_id,
            batch_responses: BTreeMap::new(),
            synthesis_responses: BTreeMap::new(),
            ensemble_responses: BTreeMap::new(),
            derived_from: None,
        }
    }

    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    pub fn takes(&self, kind: ResponseKind) -> Option<&BTreeMap<ProviderId, Vec<ProviderResponse>>> {
        match kind {
            ResponseKind::Batch => None,
            ResponseKind::Synthesis => Some(&self.synthesis_responses),
            ResponseKind::Ensemble => Some(&self.ensemble_responses),
        }
    }

    pub fn takes_mut(
        &mut self,
        kind: ResponseKind,
    ) -> Option<&mut BTreeMap<ProviderId, Vec<ProviderResponse>>> {
        match kind {
            ResponseKind::Batch => None,
            ResponseKind::Synthesis => Some(&mut self.synthesis_responses),
            ResponseKind::Ensemble => Some(&mut self.ensemble_responses),
        }
    }

    /// Batch entries plus the latest take of every derived provider.
    pub fn current_entries(&self) -> impl Iterator<Item = &ProviderResponse> {
        self.batch_responses
            .values()
            .chain(self.synthesis_responses.values().filter_map(|t| t.last()))
            .chain(self.ensemble_responses.values().filter_map(|t| t.last()))
    }

    /// True when the provider appears in any bucket of this turn.
    pub fn has_activity(&self, provider: &ProviderId) -> bool {
        self.batch_responses.contains_key(provider)
            || self
                .synthesis_responses
                .get(provider)
                .is_some_and(|t| !t.is_empty())
            || self
                .ensemble_responses
                .get(provider)
                .is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Turn {
    User(Arc<UserTurn>),
    Ai(Arc<AiTurn>),
}

impl Turn {
    pub fn id(&self) -> &TurnId {
        match self {
            Turn::User(u) => &u.id,
            Turn::Ai(a) => &a.id,
        }
    }

    pub fn as_user(&self) -> Option<&UserTurn> {
        match self {
            Turn::User(u) => Some(u),
            Turn::Ai(_) => None,
        }
    }

    pub fn as_ai(&self) -> Option<&AiTurn> {
        match self {
            Turn::Ai(a) => Some(a),
            Turn::User(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Turn::User(u) => u.session_id.as_ref(),
            Turn::Ai(a) => a.session_id.as_ref(),
        }
    }
}

/// Immutable, versioned snapshot of the turn list. Every mutation produces a new value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Conversation {
    pub version: u64,
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self { version: 0, turns }
    }

    pub fn position(&self, id: &TurnId) -> Option<usize> {
        self.turns.iter().position(|t| t.id() == id)
    }

    pub fn ai_turn(&self, id: &TurnId) -> Option<&AiTurn> {
        self.turns
            .iter()
            .filter_map(Turn::as_ai)
            .find(|a| &a.id == id)
    }

    pub fn latest_ai_turn(&self) -> Option<&AiTurn> {
        self.turns.iter().rev().find_map(Turn::as_ai)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
