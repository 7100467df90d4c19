//! Wire types for the backend protocol: inbound messages and the outbound workflow request.

use crate::constants::{BATCH_STEP_MARKERS, ENSEMBLE_STEP_MARKERS, SYNTHESIS_STEP_MARKERS};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
    SessionStarted(SessionStarted),
    PartialResult(PartialResult),
    WorkflowStepUpdate(WorkflowStepUpdate),
    WorkflowComplete(WorkflowComplete),
}

impl InboundMessage {
    /// Session id checked by the guard. `SESSION_STARTED` is never guarded.
    pub fn guarded_session(&self) -> Option<&SessionId> {
        match self {
            InboundMessage::SessionStarted(_) => None,
            InboundMessage::PartialResult(m) => Some(&m.session_id),
            InboundMessage::WorkflowStepUpdate(m) => Some(&m.session_id),
            InboundMessage::WorkflowComplete(m) => Some(&m.session_id),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            InboundMessage::SessionStarted(_) => "SESSION_STARTED",
            InboundMessage::PartialResult(_) => "PARTIAL_RESULT",
            InboundMessage::WorkflowStepUpdate(_) => "WORKFLOW_STEP_UPDATE",
            InboundMessage::WorkflowComplete(_) => "WORKFLOW_COMPLETE",
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub session_id: SessionId,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct PartialChunk {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartialResult {
    pub session_id: SessionId,
    pub step_id: String,
    pub provider_id: ProviderId,
    #[serde(default)]
    pub chunk: PartialChunk,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_response_status(self) -> ResponseStatus {
        match self {
            StepStatus::Completed => ResponseStatus::Completed,
            StepStatus::Failed => ResponseStatus::Error,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct ProviderResult {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub status: Option<ResponseStatus>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    #[serde(default)]
    pub results: Option<BTreeMap<ProviderId, ProviderResult>>,
    #[serde(default)]
    pub provider_id: Option<ProviderId>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepUpdate {
    pub session_id: SessionId,
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<StepResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowComplete {
    pub session_id: SessionId,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub final_results: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Maps a step id onto the bucket it feeds.
///
/// The only place the substring heuristic lives. Unknown patterns yield `None`
/// and are never defaulted to batch.
pub fn classify_step(step_id: &str) -> Option<ResponseKind> {
    let lower = step_id.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    if has(SYNTHESIS_STEP_MARKERS) {
        Some(ResponseKind::Synthesis)
    } else if has(ENSEMBLE_STEP_MARKERS) {
        Some(ResponseKind::Ensemble)
    } else if has(BATCH_STEP_MARKERS) {
        Some(ResponseKind::Batch)
    } else {
        None
    }
}

/// --- OUTBOUND ---

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowMode {
    NewConversation,
    Continuation,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DerivedStepSpec {
    pub providers: Vec<ProviderId>,
}

/// Primary outputs of an earlier round handed to a derived run.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalContext {
    pub user_turn_id: TurnId,
    pub user_message: String,
    pub outputs: BTreeMap<ProviderId, String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkflowRequest {
    pub session_id: Option<SessionId>,
    pub thread_id: String,
    pub mode: WorkflowMode,
    pub user_message: String,
    pub providers: Vec<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<DerivedStepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<DerivedStepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_thinking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_context: Option<HistoricalContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_step_patterns() {
        assert_eq!(classify_step("batch-1"), Some(ResponseKind::Batch));
        assert_eq!(classify_step("prompt-step"), Some(ResponseKind::Batch));
        assert_eq!(classify_step("synthesis-gemini"), Some(ResponseKind::Synthesis));
        assert_eq!(classify_step("Ensemble-2"), Some(ResponseKind::Ensemble));
        assert_eq!(classify_step("mystery-step"), None);
        assert_eq!(classify_step(""), None);
    }

    #[test]
    fn test_derived_markers_win_over_batch_markers() {
        assert_eq!(classify_step("batch-synthesis"), Some(ResponseKind::Synthesis));
        assert_eq!(classify_step("prompt-ensemble"), Some(ResponseKind::Ensemble));
    }

    #[test]
    fn test_parse_partial_result() {
        let json = r#"{"type":"PARTIAL_RESULT","sessionId":"s1","stepId":"batch-1","providerId":"claude","chunk":{"text":"Hel"}}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        match msg {
            InboundMessage::PartialResult(p) => {
                assert_eq!(p.session_id, SessionId::from("s1"));
                assert_eq!(p.provider_id, ProviderId::from("claude"));
                assert_eq!(p.chunk.text.as_deref(), Some("Hel"));
            }
            other => panic!("Expected PartialResult, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_step_update_with_results_map() {
        let json = r#"{
            "type":"WORKFLOW_STEP_UPDATE","sessionId":"s1","stepId":"batch-1","status":"completed",
            "result":{"results":{"claude":{"text":"Hello","status":"completed"},"gemini":{"text":"Hi"}}}
        }"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        let InboundMessage::WorkflowStepUpdate(update) = msg else {
            panic!("Expected WorkflowStepUpdate");
        };
        let results = update.result.unwrap().results.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[&ProviderId::from("gemini")].status, None);
    }

    #[test]
    fn test_session_started_is_not_guarded() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"SESSION_STARTED","sessionId":"s9"}"#).unwrap();
        assert!(msg.guarded_session().is_none());
        assert_eq!(msg.kind_name(), "SESSION_STARTED");
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let req = ExecuteWorkflowRequest {
            session_id: None,
            thread_id: "new".into(),
            mode: WorkflowMode::NewConversation,
            user_message: "hi".into(),
            providers: vec![ProviderId::from("claude")],
            synthesis: None,
            ensemble: None,
            use_thinking: Some(true),
            historical_context: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["mode"], "new-conversation");
        assert_eq!(v["userMessage"], "hi");
        assert_eq!(v["useThinking"], true);
        assert!(v.get("synthesis").is_none());
    }
}
