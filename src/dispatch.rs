//! Outbound dispatch and the optimistic-turn bookkeeping around it.
//!
//! Every submission is a two-phase commit: the engine applies a provisional
//! mutation and records how to undo it in a `PendingDispatch`. The dispatch either
//! settles `Ok` (confirmed in place, released on `WORKFLOW_COMPLETE`) or fails
//! and the recorded rollback is applied in full.

use crate::ingress::ExecuteWorkflowRequest;
use crate::types::{ChorusError, ProviderId, ResponseKind, Result, TurnId};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromptRequest {
    pub text: String,
    pub providers: Vec<ProviderId>,
    /// Providers asked to synthesize in the same workflow.
    pub synthesis: Vec<ProviderId>,
    pub ensemble: Vec<ProviderId>,
    pub use_thinking: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunIntent {
    /// Normal request: every eligibility rule applies.
    Fresh,
    /// Explicit re-run: a provider that already has takes gets another one.
    Rerun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedRunRequest {
    pub user_turn_id: TurnId,
    pub kind: ResponseKind,
    pub providers: Vec<ProviderId>,
    pub intent: RunIntent,
    pub use_thinking: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchTicket(pub u64);

/// What a submission produced: the request to send and where results will land.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub ticket: DispatchTicket,
    pub target_turn_id: TurnId,
    pub user_turn_id: TurnId,
    pub request: ExecuteWorkflowRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    /// Remove the optimistic user turn and its primary AI turn.
    NewRound { user_turn_id: TurnId, ai_turn_id: TurnId },
    /// Pop the takes that were started on an existing turn.
    Takes {
        turn_id: TurnId,
        kind: ResponseKind,
        started: Vec<(ProviderId, u32)>,
    },
    /// Remove a derived turn that was inserted for this run.
    DerivedTurn { turn_id: TurnId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDispatch {
    pub ticket: DispatchTicket,
    pub target: TurnId,
    pub rollback: Rollback,
    pub awaiting_session: bool,
    pub confirmed: bool,
}

/// The connection layer's outbound side.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn dispatch(&self, request: ExecuteWorkflowRequest) -> Result<()>;
}

/// Hands requests to whatever drains the channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<ExecuteWorkflowRequest>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<ExecuteWorkflowRequest>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl WorkflowDispatcher for ChannelDispatcher {
    async fn dispatch(&self, request: ExecuteWorkflowRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|e| ChorusError::Dispatch(format!("connection closed: {}", e)).into())
    }
}

/// Providers in first-seen order without duplicates.
pub fn dedupe_providers(providers: &[ProviderId]) -> Vec<ProviderId> {
    let mut out: Vec<ProviderId> = Vec::with_capacity(providers.len());
    for p in providers {
        if !out.contains(p) {
            out.push(p.clone());
        }
    }
    out
}
