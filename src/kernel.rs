//! Single-owner command loop around the engine.
//!
//! The kernel task is the only place the engine is touched. Everything else talks
//! to it through a cloneable `KernelHandle`; replies come back on oneshot channels.

use crate::delta_buffer::FrameScheduler;
use crate::dispatch::{DerivedRunRequest, Dispatch, DispatchTicket, PromptRequest, WorkflowDispatcher};
use crate::engine::{Engine, EngineEvent, MessageOutcome};
use crate::history::HistoryStore;
use crate::ingress::InboundMessage;
use crate::main_helper::EngineConfig;
use crate::round::RoundEligibility;
use crate::types::{ChorusError, Conversation, Result, SessionId, TurnId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub enum KernelCommand {
    Inbound(InboundMessage),
    /// A render frame fired; stale generations are ignored.
    Frame { generation: u64 },
    Submit {
        prompt: PromptRequest,
        resp: oneshot::Sender<Result<Dispatch>>,
    },
    RequestDerived {
        request: DerivedRunRequest,
        resp: oneshot::Sender<Result<Dispatch>>,
    },
    DispatchSettled {
        ticket: DispatchTicket,
        outcome: std::result::Result<(), String>,
    },
    SwitchSession {
        session_id: Option<SessionId>,
        resp: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        resp: oneshot::Sender<Arc<Conversation>>,
    },
    Eligibility {
        user_turn_id: TurnId,
        resp: oneshot::Sender<Option<RoundEligibility>>,
    },
    Teardown {
        resp: oneshot::Sender<Arc<Conversation>>,
    },
}

/// Fires `KernelCommand::Frame` once, `interval` after it was requested.
///
/// At most one timer is live. Every request or cancel bumps the generation, so a
/// frame already queued when its timer was superseded is recognisably stale.
pub struct TokioFrames {
    tx: mpsc::Sender<KernelCommand>,
    interval: Duration,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl TokioFrames {
    pub fn new(tx: mpsc::Sender<KernelCommand>, interval: Duration) -> Self {
        Self {
            tx,
            interval,
            generation: 0,
            pending: None,
        }
    }

    /// True when `generation` belongs to the live timer.
    pub fn is_current(&self, generation: u64) -> bool {
        self.pending.is_some() && generation == self.generation
    }

    fn abort_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl FrameScheduler for TokioFrames {
    fn request_frame(&mut self) {
        self.abort_pending();
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let interval = self.interval;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(KernelCommand::Frame { generation }).await;
        }));
    }

    fn cancel_frame(&mut self) {
        self.abort_pending();
        self.generation += 1;
    }
}

impl Drop for TokioFrames {
    fn drop(&mut self) {
        self.abort_pending();
    }
}

pub struct Kernel {
    engine: Engine<TokioFrames>,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    history: Arc<dyn HistoryStore>,
    tx_internal: mpsc::Sender<KernelCommand>,
    rx_internal: mpsc::Receiver<KernelCommand>,
    rx_cmd: mpsc::Receiver<KernelCommand>,
}

impl Kernel {
    pub fn new(
        config: &EngineConfig,
        dispatcher: Arc<dyn WorkflowDispatcher>,
        history: Arc<dyn HistoryStore>,
    ) -> (Self, KernelHandle) {
        let capacity = config.command_capacity.max(1);
        let (tx_cmd, rx_cmd) = mpsc::channel(capacity);
        // Frames and dispatch results travel on a channel the kernel owns, so the
        // loop still ends once every handle is gone.
        let (tx_internal, rx_internal) = mpsc::channel(capacity);
        let frames = TokioFrames::new(tx_internal.clone(), config.frame_interval);
        let engine = Engine::new(frames, config);

        let handle = KernelHandle {
            tx_cmd,
            events: engine.event_sender(),
            conversation: engine.watch_conversation(),
        };
        let kernel = Self {
            engine,
            dispatcher,
            history,
            tx_internal,
            rx_internal,
            rx_cmd,
        };
        (kernel, handle)
    }

    pub async fn run(mut self) {
        tracing::info!("[KERNEL] Event loop started");
        let mut torn_down = false;
        loop {
            let cmd = tokio::select! {
                biased;
                Some(cmd) = self.rx_internal.recv() => cmd,
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            if !self.handle(cmd).await {
                torn_down = true;
                break;
            }
        }
        if !torn_down {
            self.engine.teardown();
        }
        tracing::info!("[KERNEL] Event loop stopped");
    }

    /// Returns false once the kernel should stop.
    async fn handle(&mut self, cmd: KernelCommand) -> bool {
        match cmd {
            KernelCommand::Inbound(msg) => {
                let outcome = self.engine.handle_message(msg);
                if let MessageOutcome::WorkflowFinished { .. } = outcome {
                    self.persist().await;
                }
            }
            KernelCommand::Frame { generation } => {
                if self.engine.buffer().scheduler().is_current(generation) {
                    self.engine.on_frame();
                } else {
                    tracing::trace!("[KERNEL] Skipping stale frame {}", generation);
                }
            }
            KernelCommand::Submit { prompt, resp } => {
                let result = self.engine.submit_prompt(prompt);
                if let Ok(dispatch) = &result {
                    self.spawn_dispatch(dispatch);
                }
                let _ = resp.send(result);
            }
            KernelCommand::RequestDerived { request, resp } => {
                let result = self.engine.request_derived(request);
                if let Ok(dispatch) = &result {
                    self.spawn_dispatch(dispatch);
                }
                let _ = resp.send(result);
            }
            KernelCommand::DispatchSettled { ticket, outcome } => match outcome {
                Ok(()) => {
                    self.engine.confirm_dispatch(ticket);
                }
                Err(error) => {
                    self.engine.rollback_dispatch(ticket, &error);
                }
            },
            KernelCommand::SwitchSession { session_id, resp } => {
                let _ = resp.send(self.switch_session(session_id).await);
            }
            KernelCommand::Snapshot { resp } => {
                let _ = resp.send(self.engine.conversation());
            }
            KernelCommand::Eligibility { user_turn_id, resp } => {
                let _ = resp.send(self.engine.eligibility(&user_turn_id));
            }
            KernelCommand::Teardown { resp } => {
                let conversation = self.engine.teardown();
                self.persist().await;
                let _ = resp.send(conversation);
                return false;
            }
        }
        true
    }

    fn spawn_dispatch(&self, dispatch: &Dispatch) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let tx = self.tx_internal.clone();
        let ticket = dispatch.ticket;
        let request = dispatch.request.clone();
        tokio::spawn(async move {
            let outcome = dispatcher
                .dispatch(request)
                .await
                .map_err(|e| e.inner.to_string());
            let _ = tx.send(KernelCommand::DispatchSettled { ticket, outcome }).await;
        });
    }

    async fn switch_session(&mut self, session_id: Option<SessionId>) -> Result<()> {
        self.engine.flush_now();
        self.persist().await;
        let turns = match &session_id {
            Some(id) => self.history.load(id).await?,
            None => Vec::new(),
        };
        self.engine.switch_session(session_id, turns);
        Ok(())
    }

    async fn persist(&self) {
        let Some(session) = self.engine.active_session().cloned() else {
            return;
        };
        let conversation = self.engine.conversation();
        if conversation.is_empty() {
            return;
        }
        if let Err(e) = self.history.save(&session, &conversation).await {
            tracing::error!("[KERNEL] Failed to save session {}: {}", session.short(), e.inner);
        }
    }
}

#[derive(Clone)]
pub struct KernelHandle {
    tx_cmd: mpsc::Sender<KernelCommand>,
    events: broadcast::Sender<EngineEvent>,
    conversation: watch::Receiver<Arc<Conversation>>,
}

impl KernelHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn watch_conversation(&self) -> watch::Receiver<Arc<Conversation>> {
        self.conversation.clone()
    }

    pub async fn send_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.tx_cmd
            .send(KernelCommand::Inbound(msg))
            .await
            .map_err(|_| ChorusError::KernelClosed("inbound message not delivered".into()).into())
    }

    pub async fn submit_prompt(&self, prompt: PromptRequest) -> Result<Dispatch> {
        self.request(|resp| KernelCommand::Submit { prompt, resp })
            .await?
    }

    pub async fn request_derived(&self, request: DerivedRunRequest) -> Result<Dispatch> {
        self.request(|resp| KernelCommand::RequestDerived { request, resp })
            .await?
    }

    pub async fn switch_session(&self, session_id: Option<SessionId>) -> Result<()> {
        self.request(|resp| KernelCommand::SwitchSession { session_id, resp })
            .await?
    }

    pub async fn snapshot(&self) -> Result<Arc<Conversation>> {
        self.request(|resp| KernelCommand::Snapshot { resp }).await
    }

    pub async fn eligibility(&self, user_turn_id: TurnId) -> Result<Option<RoundEligibility>> {
        self.request(|resp| KernelCommand::Eligibility { user_turn_id, resp })
            .await
    }

    /// Flushes pending deltas, saves the session and stops the kernel.
    pub async fn teardown(&self) -> Result<Arc<Conversation>> {
        self.request(|resp| KernelCommand::Teardown { resp }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> KernelCommand,
    ) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.tx_cmd
            .send(make(resp))
            .await
            .map_err(|_| ChorusError::KernelClosed("command not delivered".into()))?;
        Ok(rx
            .await
            .map_err(|_| ChorusError::KernelClosed("kernel dropped the reply".into()))?)
    }
}
