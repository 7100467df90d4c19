//! The streaming aggregation engine.
//!
//! Synchronous core: every inbound message, frame tick and user action is applied
//! here, one at a time, in arrival order. `kernel` puts an async command loop in
//! front of it; tests drive it directly with `ManualFrames`.

use crate::constants::{LOG_PREVIEW_CHARS, NEW_THREAD_ID, OUTSTANDING_AT_COMPLETION_REASON};
use crate::delta_buffer::{DeltaBuffer, FlushedDelta, FrameScheduler, SourceKey};
use crate::dispatch::{
    dedupe_providers, DerivedRunRequest, Dispatch, DispatchTicket, PendingDispatch,
    PromptRequest, Rollback, RunIntent,
};
use crate::ingress::{
    DerivedStepSpec, ExecuteWorkflowRequest, HistoricalContext, InboundMessage, WorkflowMode,
};
use crate::main_helper::{EngineConfig, OutstandingPolicy};
use crate::metrics::RouterMetrics;
use crate::reducers::{self, ResponseUpdate};
use crate::round::{self, Eligibility, IneligibleReason, RoundEligibility};
use crate::router::{self, FinalUpdate, PartialUpdate, Routed};
use crate::session::{DropReason, SessionGuard};
use crate::str_utils::preview;
use crate::turn_store::{TurnStore, UpdateOutcome};
use crate::types::*;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ConversationChanged { version: u64 },
    /// A turn became complete; the UI may offer synthesis/ensemble.
    AwaitingAction { turn_id: TurnId },
    MessageDropped { reason: DropReason },
    SessionAdopted { session_id: SessionId },
    DispatchFailed { turn_id: TurnId, error: String },
    WorkflowFinished { workflow_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// Accepted into the delta buffer; visible after the next flush.
    Buffered,
    /// Applied to the conversation immediately.
    Applied,
    Dropped(DropReason),
    SessionAdopted(SessionId),
    Ignored,
    WorkflowFinished { workflow_id: Option<String> },
}

pub struct Engine<S: FrameScheduler> {
    store: TurnStore,
    buffer: DeltaBuffer<S>,
    guard: SessionGuard,
    pending: Option<PendingDispatch>,
    next_ticket: u64,
    last_failure: Option<String>,
    metrics: RouterMetrics,
    policy: OutstandingPolicy,
    published_version: u64,
    tx_events: broadcast::Sender<EngineEvent>,
    tx_snapshot: watch::Sender<Arc<Conversation>>,
}

impl<S: FrameScheduler> Engine<S> {
    pub fn new(scheduler: S, config: &EngineConfig) -> Self {
        let store = TurnStore::new();
        let (tx_events, _) = broadcast::channel(config.event_capacity.max(1));
        let (tx_snapshot, _) = watch::channel(store.conversation());
        Self {
            published_version: store.version(),
            store,
            buffer: DeltaBuffer::new(scheduler),
            guard: SessionGuard::default(),
            pending: None,
            next_ticket: 0,
            last_failure: None,
            metrics: RouterMetrics::new(),
            policy: config.outstanding_policy,
            tx_events,
            tx_snapshot,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx_events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.tx_events.clone()
    }

    /// Latest conversation snapshot; readers never block the engine.
    pub fn watch_conversation(&self) -> watch::Receiver<Arc<Conversation>> {
        self.tx_snapshot.subscribe()
    }

    pub fn conversation(&self) -> Arc<Conversation> {
        self.store.conversation()
    }

    pub fn active_session(&self) -> Option<&SessionId> {
        self.guard.active()
    }

    pub fn active_turn(&self) -> Option<&TurnId> {
        self.store.active_turn()
    }

    pub fn pending(&self) -> Option<&PendingDispatch> {
        self.pending.as_ref()
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    pub fn buffer(&self) -> &DeltaBuffer<S> {
        &self.buffer
    }

    pub fn eligibility(&self, user_turn_id: &TurnId) -> Option<RoundEligibility> {
        let conv = self.store.conversation();
        round::compute_eligibility(&conv.turns, user_turn_id)
    }

    pub fn eligibility_for(
        &self,
        user_turn_id: &TurnId,
        candidates: &[ProviderId],
    ) -> Option<RoundEligibility> {
        let conv = self.store.conversation();
        round::compute_eligibility_for(&conv.turns, user_turn_id, candidates)
    }

    /// --- INBOUND ---

    pub fn handle_message(&mut self, msg: InboundMessage) -> MessageOutcome {
        tracing::trace!("[ROUTER] Received {}", msg.kind_name());
        if let Some(session_id) = msg.guarded_session() {
            if let Err(reason) = self.guard.admit(session_id) {
                return self.dropped(reason);
            }
        }

        match router::route(msg) {
            Routed::SessionStarted(session_id) => self.on_session_started(session_id),
            Routed::Partial(update) => self.on_partial(update),
            Routed::Final(updates) => self.on_final(updates),
            Routed::StepFailed { kind, error } => self.on_step_failed(kind, &error),
            Routed::WorkflowComplete { workflow_id, error } => {
                self.on_workflow_complete(workflow_id, error)
            }
            Routed::Dropped(reason) => self.dropped(reason),
        }
    }

    /// The scheduled render frame fired.
    pub fn on_frame(&mut self) {
        let batch = self.buffer.on_frame();
        self.apply_flush(batch);
    }

    /// Drains the buffer synchronously.
    pub fn flush_now(&mut self) {
        let batch = self.buffer.flush_immediate();
        self.apply_flush(batch);
    }

    fn on_session_started(&mut self, session_id: SessionId) -> MessageOutcome {
        let awaiting = self.pending.as_ref().is_some_and(|p| p.awaiting_session);
        match self.guard.adopt(&session_id, awaiting) {
            Ok(true) => {}
            Ok(false) => return MessageOutcome::Ignored,
            Err(reason) => return self.dropped(reason),
        }
        self.store.backfill_session(&session_id);
        if let Some(pending) = self.pending.as_mut() {
            pending.awaiting_session = false;
        }
        self.emit(EngineEvent::SessionAdopted {
            session_id: session_id.clone(),
        });
        self.publish();
        MessageOutcome::SessionAdopted(session_id)
    }

    fn on_partial(&mut self, update: PartialUpdate) -> MessageOutcome {
        self.metrics.record_partial();
        let Some(target) = self.store.active_turn().cloned() else {
            return self.dropped(DropReason::NoActiveTurn);
        };
        tracing::debug!(
            "[ROUTER] {} {} += {:?}",
            update.kind,
            update.provider,
            preview(&update.text, LOG_PREVIEW_CHARS)
        );
        self.buffer.add_delta(
            SourceKey::new(target, update.provider, update.kind),
            &update.text,
            ResponseStatus::Streaming,
            update.meta,
        );
        MessageOutcome::Buffered
    }

    fn on_final(&mut self, updates: Vec<FinalUpdate>) -> MessageOutcome {
        self.metrics.record_step_update();
        let Some(target) = self.store.active_turn().cloned() else {
            return self.dropped(DropReason::NoActiveTurn);
        };
        for update in updates {
            tracing::debug!(
                "[ROUTER] {} {} final ({}, {} chars)",
                update.kind,
                update.provider,
                update.status,
                update.text.len()
            );
            self.buffer.set_complete(
                SourceKey::new(target.clone(), update.provider, update.kind),
                &update.text,
                update.status,
                update.meta,
                update.error,
            );
        }
        MessageOutcome::Buffered
    }

    fn on_step_failed(&mut self, kind: ResponseKind, error: &str) -> MessageOutcome {
        self.metrics.record_step_update();
        let Some(target) = self.store.active_turn().cloned() else {
            return self.dropped(DropReason::NoActiveTurn);
        };
        tracing::warn!("[ROUTER] {} step failed without provider: {}", kind, error);
        self.flush_now();
        let now = Utc::now();
        let outcome = self
            .store
            .update_active_turn(&target, |t| reducers::fail_outstanding_in(t, kind, error, now));
        self.after_updates(vec![outcome]);
        MessageOutcome::Applied
    }

    fn on_workflow_complete(
        &mut self,
        workflow_id: Option<String>,
        error: Option<String>,
    ) -> MessageOutcome {
        // Trailing deltas must land before anything is closed out.
        self.flush_now();

        let target = self
            .store
            .active_turn()
            .cloned()
            .or_else(|| self.pending.as_ref().map(|p| p.target.clone()));
        if let Some(err) = &error {
            tracing::warn!("[ROUTER] Workflow finished with error: {}", err);
        }
        if let (Some(target), OutstandingPolicy::MarkError) = (target, self.policy) {
            let reason = error
                .clone()
                .unwrap_or_else(|| OUTSTANDING_AT_COMPLETION_REASON.to_string());
            let now = Utc::now();
            let outcome = self
                .store
                .update_active_turn(&target, |t| reducers::fail_outstanding(t, &reason, now));
            if outcome.changed {
                tracing::warn!(
                    "[STORE] Closed outstanding entries on {} at workflow completion",
                    target.short()
                );
            }
            self.after_updates(vec![outcome]);
        }

        self.store.clear_active();
        self.pending = None;
        self.metrics.record_workflow_finished();
        self.metrics.log_summary();
        self.emit(EngineEvent::WorkflowFinished {
            workflow_id: workflow_id.clone(),
        });
        self.publish();
        MessageOutcome::WorkflowFinished { workflow_id }
    }

    fn apply_flush(&mut self, batch: Vec<FlushedDelta>) {
        if batch.is_empty() {
            return;
        }
        self.metrics.record_flush(batch.len());
        let mut outcomes = Vec::with_capacity(batch.len());
        for delta in batch {
            let update = ResponseUpdate {
                provider: delta.key.provider,
                kind: delta.key.kind,
                text: delta.text,
                status: delta.status,
                meta: delta.meta,
                error: delta.error,
                at: delta.last_at,
            };
            outcomes.push(
                self.store
                    .update_active_turn(&delta.key.turn_id, |t| reducers::apply_update(t, &update)),
            );
        }
        self.after_updates(outcomes);
    }

    fn after_updates(&mut self, outcomes: Vec<UpdateOutcome>) {
        for turn_id in outcomes.into_iter().filter_map(|o| o.completed) {
            self.emit(EngineEvent::AwaitingAction { turn_id });
        }
        self.publish();
    }

    fn dropped(&mut self, reason: DropReason) -> MessageOutcome {
        self.metrics.record_drop(&reason);
        self.emit(EngineEvent::MessageDropped {
            reason: reason.clone(),
        });
        MessageOutcome::Dropped(reason)
    }

    /// --- OUTBOUND / USER ACTIONS ---

    /// Creates the round optimistically and returns the request to dispatch.
    pub fn submit_prompt(&mut self, prompt: PromptRequest) -> Result<Dispatch> {
        self.ensure_idle()?;
        let text = prompt.text.trim();
        if text.is_empty() {
            return Err(ChorusError::InvalidRequest("prompt text is empty".into()).into());
        }
        let providers = dedupe_providers(&prompt.providers);
        if providers.is_empty() {
            return Err(ChorusError::InvalidRequest("no providers selected".into()).into());
        }
        let synthesis = dedupe_providers(&prompt.synthesis);
        let ensemble = dedupe_providers(&prompt.ensemble);

        let now = Utc::now();
        let session = self.guard.active().cloned();
        let mode = if self.store.conversation().is_empty() {
            WorkflowMode::NewConversation
        } else {
            WorkflowMode::Continuation
        };

        let user = UserTurn {
            id: TurnId::new(),
            text: text.to_string(),
            created_at: now,
            session_id: session.clone(),
        };
        let ai = AiTurn::new(user.id.clone(), session.clone(), now);
        let ai = reducers::seed_batch(&ai, &providers, now).unwrap_or(ai);
        let user_turn_id = user.id.clone();
        let ai_turn_id = ai.id.clone();
        self.store.append_round(user, ai);

        for (kind, wanted) in [
            (ResponseKind::Synthesis, &synthesis),
            (ResponseKind::Ensemble, &ensemble),
        ] {
            if !wanted.is_empty() {
                self.store
                    .update_latest_ai_turn(|t| reducers::start_takes(t, kind, wanted, now));
            }
        }
        self.store.set_active(ai_turn_id.clone());
        self.last_failure = None;

        let ticket = self.issue_ticket();
        self.pending = Some(PendingDispatch {
            ticket,
            target: ai_turn_id.clone(),
            rollback: Rollback::NewRound {
                user_turn_id: user_turn_id.clone(),
                ai_turn_id: ai_turn_id.clone(),
            },
            awaiting_session: session.is_none(),
            confirmed: false,
        });

        let request = ExecuteWorkflowRequest {
            thread_id: session
                .as_ref()
                .map(|s| s.0.clone())
                .unwrap_or_else(|| NEW_THREAD_ID.to_string()),
            session_id: session,
            mode,
            user_message: text.to_string(),
            providers,
            synthesis: (!synthesis.is_empty()).then(|| DerivedStepSpec {
                providers: synthesis,
            }),
            ensemble: (!ensemble.is_empty()).then(|| DerivedStepSpec {
                providers: ensemble,
            }),
            use_thinking: prompt.use_thinking,
            historical_context: None,
        };
        tracing::info!(
            "[ENGINE] Submitted round {} to {} providers",
            ai_turn_id.short(),
            request.providers.len()
        );
        self.publish();
        Ok(Dispatch {
            ticket,
            target_turn_id: ai_turn_id,
            user_turn_id,
            request,
        })
    }

    /// Starts a synthesis or ensemble run for an existing round.
    pub fn request_derived(&mut self, req: DerivedRunRequest) -> Result<Dispatch> {
        self.ensure_idle()?;
        if !req.kind.is_derived() {
            return Err(ChorusError::InvalidRequest(format!(
                "{} is not a derived run kind",
                req.kind
            ))
            .into());
        }
        let providers = dedupe_providers(&req.providers);
        if providers.is_empty() {
            return Err(ChorusError::InvalidRequest("no providers selected".into()).into());
        }

        let conv = self.store.conversation();
        let round = round::locate_round(&conv.turns, &req.user_turn_id)
            .ok_or_else(|| ChorusError::UnknownTurn(req.user_turn_id.0.clone()))?;
        let primary = round.primary_turn().ok_or_else(|| {
            ChorusError::InvalidRequest(format!(
                "round {} has no primary AI turn",
                req.user_turn_id.short()
            ))
        })?;

        let eligibility =
            round::compute_eligibility_for(&conv.turns, &req.user_turn_id, &providers)
                .unwrap_or_default();
        if let Some(verdicts) = eligibility.for_kind(req.kind) {
            for provider in &providers {
                match verdicts.get(provider) {
                    Some(Eligibility::Eligible) | None => {}
                    Some(Eligibility::Ineligible(IneligibleReason::AlreadyComputed))
                        if req.intent == RunIntent::Rerun => {}
                    Some(Eligibility::Ineligible(reason)) => {
                        return Err(ChorusError::NotEligible {
                            provider: provider.clone(),
                            reason: *reason,
                        }
                        .into());
                    }
                }
            }
        }

        let now = Utc::now();
        let live = round::is_live_round(&conv.turns, &round);
        let existing_derived = round::linked_derived_turns(&conv.turns, &req.user_turn_id, req.kind)
            .last()
            .map(|(_, t)| t.id.clone());

        let (target, rollback) = match (live, existing_derived) {
            (true, _) => (primary.id.clone(), None),
            (false, Some(existing)) => (existing, None),
            (false, None) => {
                let mut derived = AiTurn::new(round.user.id.clone(), self.guard.active().cloned(), now);
                derived.derived_from = Some(DerivedOrigin {
                    user_turn_id: round.user.id.clone(),
                    kind: req.kind,
                });
                let id = derived.id.clone();
                let index = round::compute_insertion_index(&conv.turns, &req.user_turn_id)
                    .unwrap_or(round.user_index + 1);
                self.store.insert_at(index, Turn::Ai(Arc::new(derived)));
                tracing::info!(
                    "[ROUND] Inserted derived {} turn {} at index {}",
                    req.kind,
                    id.short(),
                    index
                );
                (id.clone(), Some(Rollback::DerivedTurn { turn_id: id }))
            }
        };

        self.store
            .update_active_turn(&target, |t| reducers::start_takes(t, req.kind, &providers, now));
        let rollback = rollback.unwrap_or_else(|| {
            let started = self
                .store
                .conversation()
                .ai_turn(&target)
                .and_then(|t| t.takes(req.kind))
                .map(|takes| {
                    providers
                        .iter()
                        .filter_map(|p| {
                            let attempt = takes.get(p)?.last()?.attempt_number?;
                            Some((p.clone(), attempt))
                        })
                        .collect()
                })
                .unwrap_or_default();
            Rollback::Takes {
                turn_id: target.clone(),
                kind: req.kind,
                started,
            }
        });

        self.store.set_active(target.clone());
        self.last_failure = None;
        let ticket = self.issue_ticket();
        let session = self.guard.active().cloned();
        self.pending = Some(PendingDispatch {
            ticket,
            target: target.clone(),
            rollback,
            awaiting_session: session.is_none(),
            confirmed: false,
        });

        let outputs = primary
            .batch_responses
            .iter()
            .filter(|(_, r)| r.is_completed_output())
            .map(|(p, r)| (p.clone(), r.text.clone()))
            .collect();
        let step = DerivedStepSpec {
            providers: providers.clone(),
        };
        let request = ExecuteWorkflowRequest {
            thread_id: session
                .as_ref()
                .map(|s| s.0.clone())
                .unwrap_or_else(|| NEW_THREAD_ID.to_string()),
            session_id: session,
            mode: WorkflowMode::Continuation,
            user_message: round.user.text.clone(),
            providers,
            synthesis: (req.kind == ResponseKind::Synthesis).then(|| step.clone()),
            ensemble: (req.kind == ResponseKind::Ensemble).then_some(step),
            use_thinking: req.use_thinking,
            historical_context: (!live).then(|| HistoricalContext {
                user_turn_id: round.user.id.clone(),
                user_message: round.user.text.clone(),
                outputs,
            }),
        };
        tracing::info!(
            "[ENGINE] Requested {} for round {} on turn {} ({:?})",
            req.kind,
            req.user_turn_id.short(),
            target.short(),
            req.intent
        );
        self.publish();
        Ok(Dispatch {
            ticket,
            target_turn_id: target,
            user_turn_id: round.user.id.clone(),
            request,
        })
    }

    /// Phase two, success: the optimistic state stays as is.
    pub fn confirm_dispatch(&mut self, ticket: DispatchTicket) -> bool {
        match self.pending.as_mut() {
            Some(p) if p.ticket == ticket => {
                p.confirmed = true;
                tracing::debug!("[ENGINE] Dispatch {:?} confirmed", ticket);
                true
            }
            _ => false,
        }
    }

    /// Phase two, failure: the optimistic mutation is reverted entirely.
    pub fn rollback_dispatch(&mut self, ticket: DispatchTicket, error: &str) -> bool {
        if self.pending.as_ref().map(|p| p.ticket) != Some(ticket) {
            tracing::warn!("[ENGINE] Rollback for stale dispatch {:?} ignored", ticket);
            return false;
        }
        let Some(pending) = self.pending.take() else {
            return false;
        };
        self.flush_now();

        match &pending.rollback {
            Rollback::NewRound {
                user_turn_id,
                ai_turn_id,
            } => {
                self.store
                    .remove(&[user_turn_id.clone(), ai_turn_id.clone()]);
            }
            Rollback::Takes {
                turn_id,
                kind,
                started,
            } => {
                self.store
                    .update_active_turn(turn_id, |t| reducers::discard_takes(t, *kind, started));
            }
            Rollback::DerivedTurn { turn_id } => {
                self.store.remove(std::slice::from_ref(turn_id));
            }
        }
        if self.store.active_turn() == Some(&pending.target) {
            self.store.clear_active();
        }

        tracing::error!("[ENGINE] Dispatch failed, rolled back {}: {}", pending.target.short(), error);
        self.last_failure = Some(error.to_string());
        self.emit(EngineEvent::DispatchFailed {
            turn_id: pending.target,
            error: error.to_string(),
        });
        self.publish();
        true
    }

    /// Replaces the whole conversation; in-flight work for the old session is
    /// not aborted, the guard simply stops admitting it.
    pub fn switch_session(&mut self, session_id: Option<SessionId>, turns: Vec<Turn>) {
        tracing::info!(
            "[ENGINE] Switching to session {} ({} turns)",
            session_id.as_ref().map(|s| s.short()).unwrap_or("<new>"),
            turns.len()
        );
        self.buffer.clear();
        self.store.replace_all(turns);
        self.guard.switch_to(session_id);
        self.pending = None;
        self.last_failure = None;
        self.publish();
    }

    /// Mandatory synchronous flush before the host goes away.
    pub fn teardown(&mut self) -> Arc<Conversation> {
        self.flush_now();
        self.buffer.clear();
        self.metrics.log_summary();
        self.store.conversation()
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.pending {
            Some(p) => Err(ChorusError::WorkflowInFlight(p.target.0.clone()).into()),
            None => Ok(()),
        }
    }

    fn issue_ticket(&mut self) -> DispatchTicket {
        self.next_ticket += 1;
        DispatchTicket(self.next_ticket)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.tx_events.send(event);
    }

    fn publish(&mut self) {
        let conv = self.store.conversation();
        if conv.version == self.published_version {
            return;
        }
        self.published_version = conv.version;
        let version = conv.version;
        self.tx_snapshot.send_replace(conv);
        self.emit(EngineEvent::ConversationChanged { version });
    }
}
