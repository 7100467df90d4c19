//! Turn-indexed conversation state.
//!
//! The store owns one `Arc<Conversation>`. Every mutation builds a new turn list
//! (turns themselves are `Arc`-shared, so the copy is a vector of pointers) and
//! bumps the version; readers holding an older snapshot are never disturbed.

use crate::reducers;
use crate::types::{AiTurn, Conversation, SessionId, Turn, TurnId, UserTurn};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub changed: bool,
    /// Set when this update moved the turn from incomplete to complete.
    pub completed: Option<TurnId>,
}

impl UpdateOutcome {
    fn unchanged() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
pub struct TurnStore {
    conversation: Arc<Conversation>,
    active: Option<TurnId>,
}

impl TurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self) -> Arc<Conversation> {
        Arc::clone(&self.conversation)
    }

    pub fn version(&self) -> u64 {
        self.conversation.version
    }

    pub fn active_turn(&self) -> Option<&TurnId> {
        self.active.as_ref()
    }

    pub fn set_active(&mut self, id: TurnId) {
        tracing::debug!("[STORE] Active turn -> {}", id.short());
        self.active = Some(id);
    }

    pub fn clear_active(&mut self) -> Option<TurnId> {
        self.active.take()
    }

    /// Session switch: the whole conversation is swapped out.
    pub fn replace_all(&mut self, turns: Vec<Turn>) {
        self.active = None;
        self.commit(turns);
    }

    /// Appends a fresh round (user turn plus its primary AI turn).
    pub fn append_round(&mut self, user: UserTurn, ai: AiTurn) {
        let mut turns = self.conversation.turns.clone();
        turns.push(Turn::User(Arc::new(user)));
        turns.push(Turn::Ai(Arc::new(ai)));
        self.commit(turns);
    }

    pub fn insert_at(&mut self, index: usize, turn: Turn) {
        let mut turns = self.conversation.turns.clone();
        let index = index.min(turns.len());
        turns.insert(index, turn);
        self.commit(turns);
    }

    /// Removes turns by id. Only used to roll back optimistic turns.
    pub fn remove(&mut self, ids: &[TurnId]) -> usize {
        let before = self.conversation.turns.len();
        let turns: Vec<Turn> = self
            .conversation
            .turns
            .iter()
            .filter(|t| !ids.contains(t.id()))
            .cloned()
            .collect();
        let removed = before - turns.len();
        if removed > 0 {
            if self.active.as_ref().is_some_and(|a| ids.contains(a)) {
                self.active = None;
            }
            self.commit(turns);
        }
        removed
    }

    /// Applies a pure updater to the AI turn with `turn_id` and re-evaluates completion.
    pub fn update_active_turn<F>(&mut self, turn_id: &TurnId, updater: F) -> UpdateOutcome
    where
        F: FnOnce(&AiTurn) -> Option<AiTurn>,
    {
        let Some(index) = self
            .conversation
            .turns
            .iter()
            .position(|t| matches!(t, Turn::Ai(a) if &a.id == turn_id))
        else {
            tracing::warn!("[STORE] Update for unknown AI turn {}", turn_id.short());
            return UpdateOutcome::unchanged();
        };
        self.update_at(index, updater)
    }

    /// Same as `update_active_turn`, against the most recent AI turn.
    pub fn update_latest_ai_turn<F>(&mut self, updater: F) -> UpdateOutcome
    where
        F: FnOnce(&AiTurn) -> Option<AiTurn>,
    {
        let Some(index) = self
            .conversation
            .turns
            .iter()
            .rposition(|t| matches!(t, Turn::Ai(_)))
        else {
            tracing::warn!("[STORE] No AI turn to update");
            return UpdateOutcome::unchanged();
        };
        self.update_at(index, updater)
    }

    /// Stamps `session` on every turn created before the session id was known.
    pub fn backfill_session(&mut self, session: &SessionId) -> usize {
        let mut filled = 0;
        let turns: Vec<Turn> = self
            .conversation
            .turns
            .iter()
            .map(|t| match t {
                Turn::User(u) if u.session_id.is_none() => {
                    filled += 1;
                    let mut u = UserTurn::clone(u);
                    u.session_id = Some(session.clone());
                    Turn::User(Arc::new(u))
                }
                Turn::Ai(a) if a.session_id.is_none() => {
                    filled += 1;
                    let mut a = AiTurn::clone(a);
                    a.session_id = Some(session.clone());
                    Turn::Ai(Arc::new(a))
                }
                other => other.clone(),
            })
            .collect();
        if filled > 0 {
            tracing::debug!("[STORE] Backfilled session {} onto {} turns", session.short(), filled);
            self.commit(turns);
        }
        filled
    }

    fn update_at<F>(&mut self, index: usize, updater: F) -> UpdateOutcome
    where
        F: FnOnce(&AiTurn) -> Option<AiTurn>,
    {
        let Some(current) = self.conversation.turns[index].as_ai() else {
            return UpdateOutcome::unchanged();
        };
        let was_complete = reducers::is_complete(current);
        let Some(next) = updater(current) else {
            return UpdateOutcome::unchanged();
        };
        let now_complete = reducers::is_complete(&next);
        let id = next.id.clone();

        let mut turns = self.conversation.turns.clone();
        turns[index] = Turn::Ai(Arc::new(next));
        self.commit(turns);

        let mut outcome = UpdateOutcome {
            changed: true,
            completed: None,
        };
        if now_complete && !was_complete {
            tracing::info!("[STORE] Turn {} complete, awaiting action", id.short());
            if self.active.as_ref() == Some(&id) {
                self.active = None;
            }
            outcome.completed = Some(id);
        }
        outcome
    }

    fn commit(&mut self, turns: Vec<Turn>) {
        self.conversation = Arc::new(Conversation {
            version: self.conversation.version + 1,
            turns,
        });
    }
}
