//! Protocol routing: turns a (guard-admitted) inbound message into a typed update
//! carrying the bucket it targets.

use crate::ingress::{classify_step, InboundMessage, StepStatus, WorkflowStepUpdate};
use crate::session::DropReason;
use crate::types::{ProviderId, ResponseKind, ResponseStatus, SessionId};

#[derive(Debug, Clone, PartialEq)]
pub struct PartialUpdate {
    pub kind: ResponseKind,
    pub provider: ProviderId,
    pub text: String,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalUpdate {
    pub kind: ResponseKind,
    pub provider: ProviderId,
    pub text: String,
    pub status: ResponseStatus,
    pub meta: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    SessionStarted(SessionId),
    Partial(PartialUpdate),
    Final(Vec<FinalUpdate>),
    /// A failed step that names no provider: every open entry of the bucket fails.
    StepFailed {
        kind: ResponseKind,
        error: String,
    },
    WorkflowComplete {
        workflow_id: Option<String>,
        error: Option<String>,
    },
    Dropped(DropReason),
}

pub fn route(msg: InboundMessage) -> Routed {
    match msg {
        InboundMessage::SessionStarted(m) => Routed::SessionStarted(m.session_id),
        InboundMessage::PartialResult(m) => {
            let Some(kind) = classify(&m.step_id) else {
                return Routed::Dropped(DropReason::UnrecognizedStep { step_id: m.step_id });
            };
            Routed::Partial(PartialUpdate {
                kind,
                provider: m.provider_id,
                text: m.chunk.text.unwrap_or_default(),
                meta: m.chunk.meta,
            })
        }
        InboundMessage::WorkflowStepUpdate(m) => route_step_update(m),
        InboundMessage::WorkflowComplete(m) => Routed::WorkflowComplete {
            workflow_id: m.workflow_id,
            error: m.error,
        },
    }
}

fn classify(step_id: &str) -> Option<ResponseKind> {
    let kind = classify_step(step_id);
    if kind.is_none() {
        tracing::warn!(
            "[ROUTER] Dropping message for unrecognized step '{}'; not defaulting to batch",
            step_id
        );
    }
    kind
}

fn route_step_update(m: WorkflowStepUpdate) -> Routed {
    let Some(kind) = classify(&m.step_id) else {
        return Routed::Dropped(DropReason::UnrecognizedStep { step_id: m.step_id });
    };
    let step_status = m.status.as_response_status();
    let result = m.result.unwrap_or_default();

    if let Some(results) = result.results.filter(|r| !r.is_empty()) {
        let updates = results
            .into_iter()
            .map(|(provider, r)| {
                let status = match r.status {
                    Some(s) if s.is_terminal() => s,
                    _ => step_status,
                };
                let error = r.error.or_else(|| {
                    (status == ResponseStatus::Error)
                        .then(|| m.error.clone())
                        .flatten()
                });
                FinalUpdate {
                    kind,
                    provider,
                    text: r.text.unwrap_or_default(),
                    status,
                    meta: r.meta,
                    error,
                }
            })
            .collect();
        return Routed::Final(updates);
    }

    if let Some(provider) = result.provider_id {
        return Routed::Final(vec![FinalUpdate {
            kind,
            provider,
            text: result.text.unwrap_or_default(),
            status: step_status,
            meta: result.meta,
            error: m.error,
        }]);
    }

    if m.status == StepStatus::Failed {
        return Routed::StepFailed {
            kind,
            error: m.error.unwrap_or_else(|| format!("step '{}' failed", m.step_id)),
        };
    }

    tracing::warn!("[ROUTER] Step '{}' completed without any provider result", m.step_id);
    Routed::Dropped(DropReason::MissingProvider { step_id: m.step_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> InboundMessage {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_partial_routes_by_step() {
        let routed = route(parse(json!({
            "type": "PARTIAL_RESULT", "sessionId": "s1", "stepId": "synthesis-7",
            "providerId": "gemini", "chunk": {"text": "ab"}
        })));
        assert_eq!(
            routed,
            Routed::Partial(PartialUpdate {
                kind: ResponseKind::Synthesis,
                provider: ProviderId::from("gemini"),
                text: "ab".into(),
                meta: None,
            })
        );
    }

    #[test]
    fn test_unrecognized_step_is_dropped() {
        let routed = route(parse(json!({
            "type": "PARTIAL_RESULT", "sessionId": "s1", "stepId": "mystery-step",
            "providerId": "gemini", "chunk": {"text": "ab"}
        })));
        assert_eq!(
            routed,
            Routed::Dropped(DropReason::UnrecognizedStep {
                step_id: "mystery-step".into()
            })
        );
    }

    #[test]
    fn test_results_map_fans_out() {
        let routed = route(parse(json!({
            "type": "WORKFLOW_STEP_UPDATE", "sessionId": "s1", "stepId": "batch-1",
            "status": "completed",
            "result": {"results": {
                "claude": {"text": "Hello"},
                "gemini": {"text": "", "status": "error", "error": "quota"}
            }}
        })));
        let Routed::Final(updates) = routed else {
            panic!("Expected Final");
        };
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].provider, ProviderId::from("claude"));
        assert_eq!(updates[0].status, ResponseStatus::Completed);
        assert_eq!(updates[1].status, ResponseStatus::Error);
        assert_eq!(updates[1].error.as_deref(), Some("quota"));
    }

    #[test]
    fn test_non_terminal_result_status_takes_step_status() {
        let routed = route(parse(json!({
            "type": "WORKFLOW_STEP_UPDATE", "sessionId": "s1", "stepId": "batch-1",
            "status": "failed", "error": "upstream closed",
            "result": {"results": {"claude": {"text": "par", "status": "streaming"}}}
        })));
        let Routed::Final(updates) = routed else {
            panic!("Expected Final");
        };
        assert_eq!(updates[0].status, ResponseStatus::Error);
        assert_eq!(updates[0].error.as_deref(), Some("upstream closed"));
    }

    #[test]
    fn test_single_provider_result() {
        let routed = route(parse(json!({
            "type": "WORKFLOW_STEP_UPDATE", "sessionId": "s1", "stepId": "ensemble-1",
            "status": "completed", "result": {"providerId": "claude", "text": "merged"}
        })));
        let Routed::Final(updates) = routed else {
            panic!("Expected Final");
        };
        assert_eq!(updates[0].kind, ResponseKind::Ensemble);
        assert_eq!(updates[0].text, "merged");
    }

    #[test]
    fn test_failed_step_without_provider() {
        let routed = route(parse(json!({
            "type": "WORKFLOW_STEP_UPDATE", "sessionId": "s1", "stepId": "synthesis-1",
            "status": "failed", "error": "timeout"
        })));
        assert_eq!(
            routed,
            Routed::StepFailed {
                kind: ResponseKind::Synthesis,
                error: "timeout".into()
            }
        );
    }

    #[test]
    fn test_completed_step_without_provider_is_dropped() {
        let routed = route(parse(json!({
            "type": "WORKFLOW_STEP_UPDATE", "sessionId": "s1", "stepId": "batch-1",
            "status": "completed"
        })));
        assert!(matches!(routed, Routed::Dropped(DropReason::MissingProvider { .. })));
    }
}
