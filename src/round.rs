//! Round resolution and derived-run eligibility.
//!
//! A round is never cached: it is recomputed from the turn list on every query.
//! Layout of one round in the list:
//!
//! ```text
//! User(u) Derived(u)* Primary(u) | User(u') ...
//! ```
//!
//! Derived turns carry a back-reference to `u` and sit between the user turn and
//! the primary AI turn.

use crate::constants::MIN_OUTPUTS_FOR_DERIVED;
use crate::types::{AiTurn, ProviderId, ResponseKind, Turn, TurnId, UserTurn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy)]
pub struct Round<'a> {
    pub user_index: usize,
    pub user: &'a UserTurn,
    pub primary: Option<(usize, &'a AiTurn)>,
    /// Index of the next user turn, or the list length.
    pub end: usize,
}

impl<'a> Round<'a> {
    pub fn primary_turn(&self) -> Option<&'a AiTurn> {
        self.primary.map(|(_, t)| t)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    NeedTwoOutputs,
    ContinuedAfterRound,
    AlreadyComputed,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NeedTwoOutputs => "need ≥2 outputs",
            Self::ContinuedAfterRound => "provider continued after this round",
            Self::AlreadyComputed => "already computed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        matches!(self, Self::Eligible)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RoundEligibility {
    pub synthesis: BTreeMap<ProviderId, Eligibility>,
    pub ensemble: BTreeMap<ProviderId, Eligibility>,
}

impl RoundEligibility {
    pub fn for_kind(&self, kind: ResponseKind) -> Option<&BTreeMap<ProviderId, Eligibility>> {
        match kind {
            ResponseKind::Batch => None,
            ResponseKind::Synthesis => Some(&self.synthesis),
            ResponseKind::Ensemble => Some(&self.ensemble),
        }
    }
}

/// Finds the user turn and the first non-derived AI turn that follows it within the round.
pub fn locate_round<'a>(turns: &'a [Turn], user_turn_id: &TurnId) -> Option<Round<'a>> {
    let (user_index, user) = turns
        .iter()
        .enumerate()
        .find_map(|(i, t)| t.as_user().filter(|u| &u.id == user_turn_id).map(|u| (i, u)))?;

    let end = turns[user_index + 1..]
        .iter()
        .position(|t| matches!(t, Turn::User(_)))
        .map(|p| user_index + 1 + p)
        .unwrap_or(turns.len());

    let primary = turns[user_index + 1..end]
        .iter()
        .enumerate()
        .find_map(|(offset, t)| {
            t.as_ai()
                .filter(|a| !a.is_derived())
                .map(|a| (user_index + 1 + offset, a))
        });

    Some(Round {
        user_index,
        user,
        primary,
        end,
    })
}

/// Where a new derived turn for this round goes: after the last derived turn already
/// linked to the round, never past the round's primary AI turn.
pub fn compute_insertion_index(turns: &[Turn], user_turn_id: &TurnId) -> Option<usize> {
    let round = locate_round(turns, user_turn_id)?;
    let after_linked = turns[round.user_index + 1..round.end]
        .iter()
        .enumerate()
        .filter(|(_, t)| is_linked_to(t, user_turn_id))
        .map(|(offset, _)| round.user_index + 1 + offset + 1)
        .last()
        .unwrap_or(round.user_index + 1);

    Some(match round.primary {
        Some((primary_index, _)) => after_linked.min(primary_index),
        None => after_linked,
    })
}

/// Derived turns of `kind` that point back at this round, in list order.
pub fn linked_derived_turns<'a>(
    turns: &'a [Turn],
    user_turn_id: &TurnId,
    kind: ResponseKind,
) -> Vec<(usize, &'a AiTurn)> {
    turns
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.as_ai().map(|a| (i, a)))
        .filter(|(_, a)| {
            a.derived_from
                .as_ref()
                .is_some_and(|o| &o.user_turn_id == user_turn_id && o.kind == kind)
        })
        .collect()
}

/// Eligibility over the providers that answered the round's primary turn.
pub fn compute_eligibility(turns: &[Turn], user_turn_id: &TurnId) -> Option<RoundEligibility> {
    let round = locate_round(turns, user_turn_id)?;
    let candidates: Vec<ProviderId> = round
        .primary_turn()
        .map(|p| p.batch_responses.keys().cloned().collect())
        .unwrap_or_default();
    compute_eligibility_for(turns, user_turn_id, &candidates)
}

/// Per-candidate eligibility, first matching rule wins.
pub fn compute_eligibility_for(
    turns: &[Turn],
    user_turn_id: &TurnId,
    candidates: &[ProviderId],
) -> Option<RoundEligibility> {
    let round = locate_round(turns, user_turn_id)?;
    let completed_outputs = round
        .primary_turn()
        .map(|p| {
            p.batch_responses
                .values()
                .filter(|r| r.is_completed_output())
                .count()
        })
        .unwrap_or(0);

    let mut result = RoundEligibility::default();
    for kind in [ResponseKind::Synthesis, ResponseKind::Ensemble] {
        let map = if kind == ResponseKind::Synthesis {
            &mut result.synthesis
        } else {
            &mut result.ensemble
        };
        for provider in candidates {
            let verdict = if completed_outputs < MIN_OUTPUTS_FOR_DERIVED {
                Eligibility::Ineligible(IneligibleReason::NeedTwoOutputs)
            } else if has_later_activity(turns, &round, provider) {
                Eligibility::Ineligible(IneligibleReason::ContinuedAfterRound)
            } else if already_computed(turns, &round, provider, kind) {
                Eligibility::Ineligible(IneligibleReason::AlreadyComputed)
            } else {
                Eligibility::Eligible
            };
            map.insert(provider.clone(), verdict);
        }
    }
    tracing::trace!(
        "[ROUND] Eligibility for {}: {} outputs, {} candidates",
        user_turn_id.short(),
        completed_outputs,
        candidates.len()
    );
    Some(result)
}

/// True when the round's primary turn is the last AI turn and no later user turn exists.
pub fn is_live_round(turns: &[Turn], round: &Round<'_>) -> bool {
    round.end == turns.len()
        && round
            .primary
            .is_some_and(|(i, _)| turns[i + 1..].iter().all(|t| t.as_ai().is_none()))
}

fn is_linked_to(turn: &Turn, user_turn_id: &TurnId) -> bool {
    turn.as_ai()
        .and_then(|a| a.derived_from.as_ref())
        .is_some_and(|o| &o.user_turn_id == user_turn_id)
}

fn has_later_activity(turns: &[Turn], round: &Round<'_>, provider: &ProviderId) -> bool {
    turns[round.end..]
        .iter()
        .filter_map(Turn::as_ai)
        .any(|a| a.has_activity(provider))
}

fn already_computed(
    turns: &[Turn],
    round: &Round<'_>,
    provider: &ProviderId,
    kind: ResponseKind,
) -> bool {
    let on_primary = round
        .primary_turn()
        .and_then(|p| p.takes(kind))
        .and_then(|t| t.get(provider))
        .is_some_and(|takes| !takes.is_empty());
    on_primary
        || linked_derived_turns(turns, &round.user.id, kind)
            .iter()
            .any(|(_, a)| a.takes(kind).and_then(|t| t.get(provider)).is_some_and(|t| !t.is_empty()))
}
