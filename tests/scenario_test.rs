use chorus::delta_buffer::ManualFrames;
use chorus::dispatch::{DerivedRunRequest, PromptRequest, RunIntent};
use chorus::engine::{Engine, MessageOutcome};
use chorus::ingress::InboundMessage;
use chorus::round::{Eligibility, IneligibleReason};
use chorus::session::DropReason;
use chorus::*;
use serde_json::json;
use std::sync::Arc;

fn engine(session: &str) -> Engine<ManualFrames> {
    let mut e = Engine::new(ManualFrames::default(), &EngineConfig::default());
    e.switch_session(Some(SessionId::from(session)), Vec::new());
    e
}

fn ids(providers: &[&str]) -> Vec<ProviderId> {
    providers.iter().map(|p| ProviderId::from(*p)).collect()
}

fn msg(v: serde_json::Value) -> InboundMessage {
    serde_json::from_value(v).unwrap()
}

fn partial(session: &str, step: &str, provider: &str, text: &str) -> InboundMessage {
    msg(json!({
        "type": "PARTIAL_RESULT",
        "sessionId": session,
        "stepId": step,
        "providerId": provider,
        "chunk": {"text": text}
    }))
}

fn step_done(session: &str, step: &str, provider: &str, text: &str) -> InboundMessage {
    msg(json!({
        "type": "WORKFLOW_STEP_UPDATE",
        "sessionId": session,
        "stepId": step,
        "status": "completed",
        "result": {"providerId": provider, "text": text}
    }))
}

fn complete(session: &str) -> InboundMessage {
    msg(json!({"type": "WORKFLOW_COMPLETE", "sessionId": session}))
}

/// Submits a prompt and completes every provider with "<provider> answer".
fn answered_round(e: &mut Engine<ManualFrames>, text: &str, providers: &[&str]) -> (TurnId, TurnId) {
    let d = e
        .submit_prompt(PromptRequest {
            text: text.into(),
            providers: ids(providers),
            ..PromptRequest::default()
        })
        .unwrap();
    for p in providers {
        e.handle_message(step_done("s1", "batch", p, &format!("{p} answer")));
    }
    e.handle_message(complete("s1"));
    (d.user_turn_id, d.target_turn_id)
}

#[test]
fn test_batch_stream_then_final_for_both_providers() {
    let mut e = engine("s1");
    let d = e
        .submit_prompt(PromptRequest {
            text: "greet me".into(),
            providers: ids(&["claude", "gemini"]),
            ..PromptRequest::default()
        })
        .unwrap();

    e.handle_message(partial("s1", "batch-1", "claude", "Hel"));
    e.handle_message(partial("s1", "batch-1", "claude", "lo"));
    e.on_frame();
    {
        let conv = e.conversation();
        let claude = &conv.ai_turn(&d.target_turn_id).unwrap().batch_responses[&ProviderId::from("claude")];
        assert_eq!(claude.text, "Hello");
        assert_eq!(claude.status, ResponseStatus::Streaming);
    }

    e.handle_message(msg(json!({
        "type": "WORKFLOW_STEP_UPDATE",
        "sessionId": "s1",
        "stepId": "batch-1",
        "status": "completed",
        "result": {"results": {
            "claude": {"text": "Hello", "status": "completed"},
            "gemini": {"text": "Hi there", "status": "completed"}
        }}
    })));
    e.flush_now();

    let conv = e.conversation();
    let ai = conv.ai_turn(&d.target_turn_id).unwrap();
    let claude = &ai.batch_responses[&ProviderId::from("claude")];
    let gemini = &ai.batch_responses[&ProviderId::from("gemini")];
    assert_eq!((claude.text.as_str(), claude.status), ("Hello", ResponseStatus::Completed));
    assert_eq!((gemini.text.as_str(), gemini.status), ("Hi there", ResponseStatus::Completed));
    assert!(reducers::is_complete(ai));
    // Completion detaches the active pointer.
    assert_eq!(e.active_turn(), None);
}

#[test]
fn test_synthesis_twice_appends_second_take() {
    let mut e = engine("s1");
    let (user_id, ai_id) = answered_round(&mut e, "compare", &["claude", "gemini"]);

    let request = |intent| DerivedRunRequest {
        user_turn_id: user_id.clone(),
        kind: ResponseKind::Synthesis,
        providers: ids(&["gemini"]),
        intent,
        use_thinking: None,
    };

    let first = e.request_derived(request(RunIntent::Fresh)).unwrap();
    assert_eq!(first.target_turn_id, ai_id);
    assert!(first.request.historical_context.is_none());
    e.handle_message(step_done("s1", "synthesis-gemini", "gemini", "first synthesis"));
    e.handle_message(complete("s1"));

    // A plain request is blocked now; an explicit re-run is not.
    let err = e.request_derived(request(RunIntent::Fresh)).unwrap_err();
    assert!(matches!(
        err.inner,
        ChorusError::NotEligible {
            reason: IneligibleReason::AlreadyComputed,
            ..
        }
    ));
    e.request_derived(request(RunIntent::Rerun)).unwrap();
    e.handle_message(step_done("s1", "synthesis-gemini", "gemini", "second synthesis"));
    e.handle_message(complete("s1"));

    let conv = e.conversation();
    let takes = &conv.ai_turn(&ai_id).unwrap().synthesis_responses[&ProviderId::from("gemini")];
    assert_eq!(takes.len(), 2);
    assert_eq!(takes[0].text, "first synthesis");
    assert_eq!(takes[1].text, "second synthesis");
    assert_eq!(takes[1].attempt_number, Some(2));
}

#[test]
fn test_mystery_step_leaves_conversation_untouched() {
    let mut e = engine("s1");
    e.submit_prompt(PromptRequest {
        text: "q".into(),
        providers: ids(&["claude"]),
        ..PromptRequest::default()
    })
    .unwrap();
    let before = e.conversation();

    let outcome = e.handle_message(partial("s1", "mystery-step", "claude", "lost"));
    e.flush_now();

    assert_eq!(
        outcome,
        MessageOutcome::Dropped(DropReason::UnrecognizedStep {
            step_id: "mystery-step".into()
        })
    );
    assert!(Arc::ptr_eq(&before, &e.conversation()));
}

#[test]
fn test_stale_session_never_mutates_under_any_ordering() {
    let stale = [
        partial("old", "batch", "claude", "zzz"),
        step_done("old", "batch", "claude", "zzz"),
        complete("old"),
    ];
    // Every rotation of the stale messages, interleaved before and after live ones.
    for shift in 0..stale.len() {
        let mut e = engine("s1");
        let d = e
            .submit_prompt(PromptRequest {
                text: "q".into(),
                providers: ids(&["claude"]),
                ..PromptRequest::default()
            })
            .unwrap();
        for i in 0..stale.len() {
            e.flush_now();
            let before = e.conversation();
            let outcome = e.handle_message(stale[(i + shift) % stale.len()].clone());
            e.flush_now();
            assert!(matches!(
                outcome,
                MessageOutcome::Dropped(DropReason::StaleSession { .. })
            ));
            assert!(Arc::ptr_eq(&before, &e.conversation()));
            e.handle_message(partial("s1", "batch", "claude", "a"));
        }
        e.flush_now();
        let conv = e.conversation();
        assert_eq!(
            conv.ai_turn(&d.target_turn_id).unwrap().batch_responses[&ProviderId::from("claude")].text,
            "aaa"
        );
        assert_eq!(e.metrics().stale_dropped, 3);
    }
}

#[test]
fn test_late_session_start_for_abandoned_request_is_refused() {
    let mut e = Engine::new(ManualFrames::default(), &EngineConfig::default());
    let prompt = |text: &str| PromptRequest {
        text: text.into(),
        providers: ids(&["claude"]),
        ..PromptRequest::default()
    };
    e.submit_prompt(prompt("first")).unwrap();
    // The user starts a fresh chat before the backend answers the first request.
    e.switch_session(None, Vec::new());

    let outcome = e.handle_message(msg(json!({"type": "SESSION_STARTED", "sessionId": "sA"})));
    assert_eq!(
        outcome,
        MessageOutcome::Dropped(DropReason::StaleSession {
            expected: None,
            got: SessionId::from("sA"),
        })
    );

    let d = e.submit_prompt(prompt("second")).unwrap();
    assert_eq!(d.request.session_id, None);
    assert_eq!(d.request.thread_id, chorus::constants::NEW_THREAD_ID);

    let before = e.conversation();
    let outcome = e.handle_message(msg(json!({
        "type": "WORKFLOW_COMPLETE", "sessionId": "sA", "workflowId": "wf-A"
    })));
    assert!(matches!(
        outcome,
        MessageOutcome::Dropped(DropReason::StaleSession { .. })
    ));
    assert!(Arc::ptr_eq(&before, &e.conversation()));
    let conv = e.conversation();
    assert_eq!(
        conv.ai_turn(&d.target_turn_id).unwrap().batch_responses[&ProviderId::from("claude")].status,
        ResponseStatus::Pending
    );
    assert!(e.pending().is_some());

    let outcome = e.handle_message(msg(json!({"type": "SESSION_STARTED", "sessionId": "sB"})));
    assert_eq!(outcome, MessageOutcome::SessionAdopted(SessionId::from("sB")));
}

#[test]
fn test_single_output_round_is_ineligible_for_everyone() {
    let mut e = engine("s1");
    let d = e
        .submit_prompt(PromptRequest {
            text: "q".into(),
            providers: ids(&["claude", "gemini"]),
            ..PromptRequest::default()
        })
        .unwrap();
    e.handle_message(step_done("s1", "batch", "claude", "only one"));
    e.handle_message(msg(json!({
        "type": "WORKFLOW_STEP_UPDATE", "sessionId": "s1", "stepId": "batch",
        "status": "failed", "error": "quota",
        "result": {"providerId": "gemini"}
    })));
    e.handle_message(complete("s1"));

    let eligibility = e.eligibility(&d.user_turn_id).unwrap();
    for verdict in eligibility.synthesis.values().chain(eligibility.ensemble.values()) {
        assert_eq!(*verdict, Eligibility::Ineligible(IneligibleReason::NeedTwoOutputs));
    }
    assert_eq!(IneligibleReason::NeedTwoOutputs.to_string(), "need ≥2 outputs");
}

#[test]
fn test_historical_derived_run_inserts_turn_before_primary() {
    let mut e = engine("s1");
    let (u1, a1) = answered_round(&mut e, "first", &["claude", "gemini"]);
    answered_round(&mut e, "second", &["claude"]);

    let eligibility = e.eligibility(&u1).unwrap();
    assert_eq!(
        eligibility.ensemble[&ProviderId::from("claude")],
        Eligibility::Ineligible(IneligibleReason::ContinuedAfterRound)
    );
    assert!(eligibility.ensemble[&ProviderId::from("gemini")].is_eligible());

    let blocked = e.request_derived(DerivedRunRequest {
        user_turn_id: u1.clone(),
        kind: ResponseKind::Ensemble,
        providers: ids(&["claude"]),
        intent: RunIntent::Rerun,
        use_thinking: None,
    });
    assert!(matches!(
        blocked.unwrap_err().inner,
        ChorusError::NotEligible {
            reason: IneligibleReason::ContinuedAfterRound,
            ..
        }
    ));

    let d = e
        .request_derived(DerivedRunRequest {
            user_turn_id: u1.clone(),
            kind: ResponseKind::Ensemble,
            providers: ids(&["gemini"]),
            intent: RunIntent::Fresh,
            use_thinking: None,
        })
        .unwrap();
    let context = d.request.historical_context.as_ref().unwrap();
    assert_eq!(context.user_message, "first");
    assert_eq!(context.outputs.len(), 2);

    let conv = e.conversation();
    assert_eq!(conv.position(&u1), Some(0));
    assert_eq!(conv.position(&d.target_turn_id), Some(1));
    assert_eq!(conv.position(&a1), Some(2));
    let derived = conv.ai_turn(&d.target_turn_id).unwrap();
    assert_eq!(derived.derived_from.as_ref().unwrap().kind, ResponseKind::Ensemble);

    e.handle_message(step_done("s1", "ensemble-1", "gemini", "merged"));
    e.flush_now();
    let conv = e.conversation();
    let take = &conv.ai_turn(&d.target_turn_id).unwrap().ensemble_responses[&ProviderId::from("gemini")][0];
    assert_eq!(take.text, "merged");
    assert_eq!(take.status, ResponseStatus::Completed);
}

#[test]
fn test_failed_derived_dispatch_removes_inserted_turn() {
    let mut e = engine("s1");
    let (u1, _) = answered_round(&mut e, "first", &["claude", "gemini"]);
    answered_round(&mut e, "second", &["claude"]);
    let before = e.conversation().len();

    let d = e
        .request_derived(DerivedRunRequest {
            user_turn_id: u1,
            kind: ResponseKind::Synthesis,
            providers: ids(&["gemini"]),
            intent: RunIntent::Fresh,
            use_thinking: None,
        })
        .unwrap();
    assert_eq!(e.conversation().len(), before + 1);

    assert!(e.rollback_dispatch(d.ticket, "offline"));
    let conv = e.conversation();
    assert_eq!(conv.len(), before);
    assert!(conv.ai_turn(&d.target_turn_id).is_none());
}

#[test]
fn test_failed_live_rerun_discards_only_new_take() {
    let mut e = engine("s1");
    let (user_id, ai_id) = answered_round(&mut e, "q", &["claude", "gemini"]);
    let request = DerivedRunRequest {
        user_turn_id: user_id,
        kind: ResponseKind::Synthesis,
        providers: ids(&["claude"]),
        intent: RunIntent::Rerun,
        use_thinking: None,
    };
    e.request_derived(request.clone()).unwrap();
    e.handle_message(step_done("s1", "synthesis", "claude", "kept"));
    e.handle_message(complete("s1"));

    let d = e.request_derived(request).unwrap();
    assert!(e.rollback_dispatch(d.ticket, "offline"));

    let conv = e.conversation();
    let ai = conv.ai_turn(&ai_id).unwrap();
    let takes = &ai.synthesis_responses[&ProviderId::from("claude")];
    assert_eq!(takes.len(), 1);
    assert_eq!(takes[0].text, "kept");
    assert!(reducers::is_complete(ai));
}
