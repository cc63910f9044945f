//! Items the engine hands to the orchestrator
//!
//! Stream messages are the Agent SDK's own [`Message`] type. Permission
//! prompts, which the SDK delivers through its `can_use_tool` callback, are
//! folded into the same stream so the turn task sees one ordered sequence.

use claude_code_agent_sdk::{Message, PermissionResult, PermissionResultAllow, PermissionResultDeny};
use serde_json::Value;

/// One item of the engine's stream as seen by the orchestrator
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Regular stream message
    Message(Message),
    /// The engine asks whether a tool call may proceed
    PermissionRequest(PermissionRequest),
}

impl EngineEvent {
    /// Whether this event closes the turn
    pub fn is_result(&self) -> bool {
        matches!(self, EngineEvent::Message(Message::Result(_)))
    }
}

/// Engine permission prompt for a gated tool call
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    /// Correlation id to echo in the response
    pub request_id: String,
    /// Tool the engine wants to run
    pub tool_name: String,
    /// Tool input as given by the model
    pub input: Value,
    /// Tool use block this request belongs to, when the engine reports it
    pub tool_use_id: Option<String>,
}

/// Answer to a [`PermissionRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Run the tool with its original input
    Allow,
    /// Refuse; the message is shown to the model
    Deny { message: String },
}

impl PermissionDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionDecision::Allow)
    }

    /// SDK callback result; a deny does not abort the whole turn
    pub fn into_result(self) -> PermissionResult {
        match self {
            PermissionDecision::Allow => PermissionResult::Allow(PermissionResultAllow::default()),
            PermissionDecision::Deny { message } => PermissionResult::Deny(PermissionResultDeny {
                message,
                interrupt: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_result_closes_turn() {
        let result: Message = serde_json::from_value(json!({
            "type": "result",
            "subtype": "success",
            "duration_ms": 1500,
            "duration_api_ms": 1200,
            "is_error": false,
            "num_turns": 2,
            "session_id": "abc",
            "total_cost_usd": 0.0123
        }))
        .unwrap();
        assert!(EngineEvent::Message(result).is_result());

        let system: Message =
            serde_json::from_value(json!({"type": "system", "subtype": "init"})).unwrap();
        assert!(!EngineEvent::Message(system).is_result());

        let prompt = EngineEvent::PermissionRequest(PermissionRequest {
            request_id: "p1".to_string(),
            tool_name: "Bash".to_string(),
            input: json!({}),
            tool_use_id: None,
        });
        assert!(!prompt.is_result());
    }

    #[test]
    fn test_permission_decision() {
        assert!(PermissionDecision::Allow.is_allow());
        assert!(matches!(
            PermissionDecision::Allow.into_result(),
            PermissionResult::Allow(_)
        ));

        let deny = PermissionDecision::Deny {
            message: "no".to_string(),
        };
        assert!(!deny.is_allow());
        match deny.into_result() {
            PermissionResult::Deny(deny) => {
                assert_eq!(deny.message, "no");
                assert!(!deny.interrupt);
            }
            PermissionResult::Allow(_) => panic!("expected deny"),
        }
    }
}
