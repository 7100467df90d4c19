//! Pure update functions over a single `AiTurn`.
//!
//! Every function takes the current turn by reference and returns `Some(new_turn)`
//! when something changed, `None` otherwise. The store swaps the result in.

use crate::types::{AiTurn, ProviderId, ProviderResponse, ResponseKind, ResponseStatus};
use chrono::{DateTime, Utc};

/// One flushed or authoritative update addressed to a bucket entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseUpdate {
    pub provider: ProviderId,
    pub kind: ResponseKind,
    pub text: String,
    pub status: ResponseStatus,
    pub meta: Option<serde_json::Value>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Merge rule for a single entry.
///
/// Missing entry: created from the update. Non-terminal update on a live entry:
/// appended. Terminal update: replaces the text wholesale. Non-terminal update on
/// a terminal entry: ignored, status never moves backwards.
pub fn merge_response(
    existing: Option<&ProviderResponse>,
    update: &ResponseUpdate,
) -> Option<ProviderResponse> {
    let Some(current) = existing else {
        return Some(ProviderResponse {
            provider_id: update.provider.clone(),
            text: update.text.clone(),
            status: update.status,
            created_at: update.at,
            updated_at: Some(update.at),
            attempt_number: None,
            meta: update.meta.clone(),
            error: update.error.clone(),
        });
    };

    if current.status.is_terminal() && !update.status.is_terminal() {
        tracing::trace!(
            "[STORE] Ignoring {} chunk for {} after terminal status {}",
            update.kind,
            update.provider,
            current.status
        );
        return None;
    }

    let mut next = current.clone();
    if update.status.is_terminal() {
        if !(update.status == ResponseStatus::Error && update.text.is_empty()) {
            next.text = update.text.clone();
        }
        next.status = update.status;
        next.error = update.error.clone();
    } else {
        let meta_unchanged = update.meta.is_none() || update.meta == current.meta;
        if update.text.is_empty() && update.status == current.status && meta_unchanged {
            return None;
        }
        next.text.push_str(&update.text);
        next.status = if update.text.is_empty() {
            update.status
        } else {
            ResponseStatus::Streaming
        };
    }
    if update.meta.is_some() {
        next.meta = update.meta.clone();
    }
    next.updated_at = Some(update.at);
    Some(next)
}

pub fn apply_batch(turn: &AiTurn, update: &ResponseUpdate) -> Option<AiTurn> {
    let merged = merge_response(turn.batch_responses.get(&update.provider), update)?;
    let mut next = turn.clone();
    next.batch_responses.insert(update.provider.clone(), merged);
    Some(next)
}

/// Merges into the provider's latest take, creating the first take if none exists.
pub fn apply_take(turn: &AiTurn, update: &ResponseUpdate) -> Option<AiTurn> {
    let takes = turn.takes(update.kind)?;
    let existing = takes.get(&update.provider).and_then(|t| t.last());
    let mut merged = merge_response(existing, update)?;
    if merged.attempt_number.is_none() {
        merged.attempt_number = Some(1);
    }

    let mut next = turn.clone();
    let list = next
        .takes_mut(update.kind)?
        .entry(update.provider.clone())
        .or_default();
    match list.last_mut() {
        Some(last) => *last = merged,
        None => list.push(merged),
    }
    Some(next)
}

/// Bucket-agnostic entry point.
pub fn apply_update(turn: &AiTurn, update: &ResponseUpdate) -> Option<AiTurn> {
    match update.kind {
        ResponseKind::Batch => apply_batch(turn, update),
        ResponseKind::Synthesis | ResponseKind::Ensemble => apply_take(turn, update),
    }
}

/// Adds pending batch placeholders for providers that have no entry yet.
pub fn seed_batch(turn: &AiTurn, providers: &[ProviderId], at: DateTime<Utc>) -> Option<AiTurn> {
    let missing: Vec<_> = providers
        .iter()
        .filter(|p| !turn.batch_responses.contains_key(*p))
        .collect();
    if missing.is_empty() {
        return None;
    }
    let mut next = turn.clone();
    for p in missing {
        next.batch_responses
            .insert(p.clone(), ProviderResponse::pending(p.clone(), at));
    }
    Some(next)
}

/// Starts a fresh run: appends a new pending take for each provider.
pub fn start_takes(
    turn: &AiTurn,
    kind: ResponseKind,
    providers: &[ProviderId],
    at: DateTime<Utc>,
) -> Option<AiTurn> {
    if providers.is_empty() || !kind.is_derived() {
        return None;
    }
    let mut next = turn.clone();
    let takes = next.takes_mut(kind)?;
    for p in providers {
        let list = takes.entry(p.clone()).or_default();
        let mut take = ProviderResponse::pending(p.clone(), at);
        take.attempt_number = Some(list.len() as u32 + 1);
        list.push(take);
    }
    Some(next)
}

/// Undoes `start_takes`: pops the latest take of each provider if it is still the
/// attempt that was started, dropping the provider key when no takes remain.
pub fn discard_takes(
    turn: &AiTurn,
    kind: ResponseKind,
    started: &[(ProviderId, u32)],
) -> Option<AiTurn> {
    let mut next = turn.clone();
    let takes = next.takes_mut(kind)?;
    let mut changed = false;
    for (provider, attempt) in started {
        let Some(list) = takes.get_mut(provider) else {
            continue;
        };
        if list.last().and_then(|t| t.attempt_number) == Some(*attempt) {
            list.pop();
            changed = true;
        }
        if list.is_empty() {
            takes.remove(provider);
        }
    }
    changed.then_some(next)
}

/// Forces every open entry of one bucket to `error`.
pub fn fail_outstanding_in(
    turn: &AiTurn,
    kind: ResponseKind,
    reason: &str,
    at: DateTime<Utc>,
) -> Option<AiTurn> {
    let mut next = turn.clone();
    let mut changed = false;
    let mut fail = |r: &mut ProviderResponse| {
        if !r.status.is_terminal() {
            r.status = ResponseStatus::Error;
            r.error = Some(reason.to_string());
            r.updated_at = Some(at);
            changed = true;
        }
    };
    if !kind.is_derived() {
        next.batch_responses.values_mut().for_each(&mut fail);
    } else if let Some(takes) = next.takes_mut(kind) {
        takes
            .values_mut()
            .filter_map(|t| t.last_mut())
            .for_each(&mut fail);
    }
    changed.then_some(next)
}

/// Forces every open entry in all three buckets to `error`.
pub fn fail_outstanding(turn: &AiTurn, reason: &str, at: DateTime<Utc>) -> Option<AiTurn> {
    let mut current: Option<AiTurn> = None;
    for kind in [
        ResponseKind::Batch,
        ResponseKind::Synthesis,
        ResponseKind::Ensemble,
    ] {
        let base = current.as_ref().unwrap_or(turn);
        if let Some(next) = fail_outstanding_in(base, kind, reason, at) {
            current = Some(next);
        }
    }
    current
}

/// Complete when at least one entry exists and every batch entry and latest take is terminal.
pub fn is_complete(turn: &AiTurn) -> bool {
    let mut seen = false;
    for entry in turn.current_entries() {
        if !entry.status.is_terminal() {
            return false;
        }
        seen = true;
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnId;

    fn turn() -> AiTurn {
        AiTurn::new(TurnId::from("u1"), None, Utc::now())
    }

    fn update(provider: &str, kind: ResponseKind, text: &str, status: ResponseStatus) -> ResponseUpdate {
        ResponseUpdate {
            provider: ProviderId::from(provider),
            kind,
            text: text.to_string(),
            status,
            meta: None,
            error: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_entry_is_created() {
        let t = apply_batch(&turn(), &update("claude", ResponseKind::Batch, "Hel", ResponseStatus::Streaming)).unwrap();
        let r = &t.batch_responses[&ProviderId::from("claude")];
        assert_eq!(r.text, "Hel");
        assert_eq!(r.status, ResponseStatus::Streaming);
    }

    #[test]
    fn test_streaming_chunks_append() {
        let t = apply_batch(&turn(), &update("claude", ResponseKind::Batch, "Hel", ResponseStatus::Streaming)).unwrap();
        let t = apply_batch(&t, &update("claude", ResponseKind::Batch, "lo", ResponseStatus::Streaming)).unwrap();
        assert_eq!(t.batch_responses[&ProviderId::from("claude")].text, "Hello");
    }

    #[test]
    fn test_meta_only_chunk_updates_meta() {
        let t = apply_batch(&turn(), &update("claude", ResponseKind::Batch, "a", ResponseStatus::Streaming)).unwrap();
        let mut meta_only = update("claude", ResponseKind::Batch, "", ResponseStatus::Streaming);
        meta_only.meta = Some(serde_json::json!({"model": "x"}));
        let t = apply_batch(&t, &meta_only).unwrap();
        let r = &t.batch_responses[&ProviderId::from("claude")];
        assert_eq!(r.text, "a");
        assert_eq!(r.meta, Some(serde_json::json!({"model": "x"})));

        // Same meta again carries nothing new.
        assert!(apply_batch(&t, &meta_only).is_none());
    }

    #[test]
    fn test_pending_placeholder_moves_to_streaming() {
        let seeded = seed_batch(&turn(), &[ProviderId::from("claude")], Utc::now()).unwrap();
        let t = apply_batch(&seeded, &update("claude", ResponseKind::Batch, "x", ResponseStatus::Pending)).unwrap();
        assert_eq!(t.batch_responses[&ProviderId::from("claude")].status, ResponseStatus::Streaming);
    }

    #[test]
    fn test_terminal_update_replaces_text() {
        let t = apply_batch(&turn(), &update("claude", ResponseKind::Batch, "Hello  ", ResponseStatus::Streaming)).unwrap();
        let t = apply_batch(&t, &update("claude", ResponseKind::Batch, "Hello", ResponseStatus::Completed)).unwrap();
        let r = &t.batch_responses[&ProviderId::from("claude")];
        assert_eq!(r.text, "Hello");
        assert_eq!(r.status, ResponseStatus::Completed);
    }

    #[test]
    fn test_streaming_after_terminal_is_ignored() {
        let t = apply_batch(&turn(), &update("claude", ResponseKind::Batch, "done", ResponseStatus::Completed)).unwrap();
        assert!(apply_batch(&t, &update("claude", ResponseKind::Batch, "more", ResponseStatus::Streaming)).is_none());
    }

    #[test]
    fn test_error_without_text_keeps_accumulated() {
        let t = apply_batch(&turn(), &update("claude", ResponseKind::Batch, "half", ResponseStatus::Streaming)).unwrap();
        let mut failed = update("claude", ResponseKind::Batch, "", ResponseStatus::Error);
        failed.error = Some("boom".into());
        let t = apply_batch(&t, &failed).unwrap();
        let r = &t.batch_responses[&ProviderId::from("claude")];
        assert_eq!(r.text, "half");
        assert_eq!(r.status, ResponseStatus::Error);
        assert_eq!(r.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_take_merge_goes_to_latest_take() {
        let gemini = ProviderId::from("gemini");
        let t = start_takes(&turn(), ResponseKind::Synthesis, &[gemini.clone()], Utc::now()).unwrap();
        let t = apply_take(&t, &update("gemini", ResponseKind::Synthesis, "first", ResponseStatus::Completed)).unwrap();
        let t = start_takes(&t, ResponseKind::Synthesis, &[gemini.clone()], Utc::now()).unwrap();
        let t = apply_take(&t, &update("gemini", ResponseKind::Synthesis, "sec", ResponseStatus::Streaming)).unwrap();

        let takes = &t.synthesis_responses[&gemini];
        assert_eq!(takes.len(), 2);
        assert_eq!(takes[0].text, "first");
        assert_eq!(takes[1].text, "sec");
        assert_eq!(takes[1].attempt_number, Some(2));
    }

    #[test]
    fn test_take_created_without_explicit_start() {
        let t = apply_take(&turn(), &update("gemini", ResponseKind::Ensemble, "x", ResponseStatus::Streaming)).unwrap();
        let takes = &t.ensemble_responses[&ProviderId::from("gemini")];
        assert_eq!(takes.len(), 1);
        assert_eq!(takes[0].attempt_number, Some(1));
    }

    #[test]
    fn test_discard_takes_only_pops_matching_attempt() {
        let gemini = ProviderId::from("gemini");
        let t = start_takes(&turn(), ResponseKind::Synthesis, &[gemini.clone()], Utc::now()).unwrap();
        let t = start_takes(&t, ResponseKind::Synthesis, &[gemini.clone()], Utc::now()).unwrap();
        assert!(discard_takes(&t, ResponseKind::Synthesis, &[(gemini.clone(), 1)]).is_none());
        let t = discard_takes(&t, ResponseKind::Synthesis, &[(gemini.clone(), 2)]).unwrap();
        assert_eq!(t.synthesis_responses[&gemini].len(), 1);
        let t = discard_takes(&t, ResponseKind::Synthesis, &[(gemini.clone(), 1)]).unwrap();
        assert!(!t.synthesis_responses.contains_key(&gemini));
    }

    #[test]
    fn test_completion_requires_entries() {
        assert!(!is_complete(&turn()));
    }

    #[test]
    fn test_completion_considers_latest_takes() {
        let t = apply_batch(&turn(), &update("claude", ResponseKind::Batch, "a", ResponseStatus::Completed)).unwrap();
        assert!(is_complete(&t));
        let t = start_takes(&t, ResponseKind::Synthesis, &[ProviderId::from("claude")], Utc::now()).unwrap();
        assert!(!is_complete(&t));
        let t = apply_take(&t, &update("claude", ResponseKind::Synthesis, "", ResponseStatus::Error)).unwrap();
        assert!(is_complete(&t));
    }

    #[test]
    fn test_fail_outstanding_marks_open_entries() {
        let seeded = seed_batch(
            &turn(),
            &[ProviderId::from("claude"), ProviderId::from("gemini")],
            Utc::now(),
        )
        .unwrap();
        let t = apply_batch(&seeded, &update("claude", ResponseKind::Batch, "ok", ResponseStatus::Completed)).unwrap();
        let t = fail_outstanding(&t, "timeout", Utc::now()).unwrap();
        assert_eq!(t.batch_responses[&ProviderId::from("claude")].status, ResponseStatus::Completed);
        let g = &t.batch_responses[&ProviderId::from("gemini")];
        assert_eq!(g.status, ResponseStatus::Error);
        assert_eq!(g.error.as_deref(), Some("timeout"));
        assert!(is_complete(&t));
        assert!(fail_outstanding(&t, "timeout", Utc::now()).is_none());
    }
}
