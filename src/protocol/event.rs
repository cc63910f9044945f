//! Event types exchanged over a session connection
//!
//! Client events arrive as `{"type": ..., "data": {...}}` frames. Server
//! events are serialized with the same envelope. Persisted events carry an
//! extra `timestamp` and are kept as [`EventRecord`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operator message starting (or redirecting) a turn
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserMessage {
    /// Message text
    #[serde(default)]
    pub content: String,
    /// Files the agent should read before answering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<String>>,
}

impl UserMessage {
    /// Create a plain text message
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            file_paths: None,
        }
    }

    /// Attached file paths, empty if none
    pub fn attachments(&self) -> &[String] {
        self.file_paths.as_deref().unwrap_or_default()
    }

    /// A message with blank content and no attachments carries nothing to do
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty() && self.attachments().is_empty()
    }
}

/// Operator decision on a pending approval request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Whether the tool call may proceed
    pub approved: bool,
    /// Optional reason, used as the denial message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Client-originated events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Start a turn, or redirect the one in flight
    UserMessage(UserMessage),
    /// Resolve the pending approval
    ApprovalResponse(ApprovalResponse),
    /// Stop the turn in flight
    Interrupt,
    /// Drop the session log and start over with a new identifier
    ClearSession,
}

impl ClientEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::UserMessage(_) => "user_message",
            ClientEvent::ApprovalResponse(_) => "approval_response",
            ClientEvent::Interrupt => "interrupt",
            ClientEvent::ClearSession => "clear_session",
        }
    }
}

/// Values carried by `status` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Connection bound to a session
    Connected,
    /// A turn is running
    Thinking,
    /// A tool call is waiting for the operator
    AwaitingApproval,
    /// The turn in flight was interrupted
    Interrupted,
    /// The turn finished
    Done,
    /// The turn failed
    Error,
    /// The session was cleared and re-keyed
    SessionCleared,
    /// An approval request expired and was denied
    ApprovalTimeout,
}

/// Server-originated events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Assistant text block
    AssistantText { text: String },
    /// Extended thinking block
    Thinking { thinking: String },
    /// Tool invocation announced by the engine
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        tool_input: Value,
    },
    /// Tool output
    ToolResult {
        tool_use_id: String,
        result: String,
        is_error: bool,
    },
    /// A gated tool call needs an operator decision
    ApprovalRequest { tool_name: String, tool_input: Value },
    /// Terminal turn summary
    Result {
        cost: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    /// Turn failure visible to the operator
    Error { message: String },
    /// Session state notice
    Status {
        status: StatusKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Replay of the persisted session log
    History { messages: Vec<EventRecord> },
}

impl ServerEvent {
    /// Status event without a session identifier
    pub fn status(status: StatusKind) -> Self {
        ServerEvent::Status {
            status,
            session_id: None,
        }
    }

    /// Status event carrying the session identifier
    pub fn status_for(status: StatusKind, session_id: impl Into<String>) -> Self {
        ServerEvent::Status {
            status,
            session_id: Some(session_id.into()),
        }
    }

    /// Error event
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::AssistantText { .. } => "assistant_text",
            ServerEvent::Thinking { .. } => "thinking",
            ServerEvent::ToolUse { .. } => "tool_use",
            ServerEvent::ToolResult { .. } => "tool_result",
            ServerEvent::ApprovalRequest { .. } => "approval_request",
            ServerEvent::Result { .. } => "result",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Status { .. } => "status",
            ServerEvent::History { .. } => "history",
        }
    }

    /// Whether this event belongs in the durable session log
    ///
    /// Status notices, history replays and approval prompts describe
    /// transient connection state and are not replayed.
    pub fn is_persisted(&self) -> bool {
        !matches!(
            self,
            ServerEvent::Status { .. }
                | ServerEvent::History { .. }
                | ServerEvent::ApprovalRequest { .. }
        )
    }

    /// Status value, if this is a status event
    pub fn status_kind(&self) -> Option<StatusKind> {
        match self {
            ServerEvent::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One persisted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event type name
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload
    #[serde(default)]
    pub data: Value,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Create a record stamped with the current time
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Record of the operator's own message
    pub fn user_message(message: &UserMessage) -> Self {
        let data = serde_json::json!({
            "content": message.content,
            "file_paths": message.file_paths,
        });
        Self::new("user_message", data)
    }

    /// Record of a server event
    pub fn from_server(event: &ServerEvent) -> serde_json::Result<Self> {
        let mut value = serde_json::to_value(event)?;
        let data = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Self::new(event.kind(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_user_message_blank() {
        assert!(UserMessage::text("   ").is_blank());
        assert!(!UserMessage::text("hi").is_blank());

        let with_files = UserMessage {
            content: String::new(),
            file_paths: Some(vec!["/tmp/a.txt".to_string()]),
        };
        assert!(!with_files.is_blank());
        assert_eq!(with_files.attachments(), ["/tmp/a.txt".to_string()]);
    }

    #[test]
    fn test_server_event_envelope() {
        let event = ServerEvent::ToolResult {
            tool_use_id: "tu_1".to_string(),
            result: "Done".to_string(),
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "tool_result",
                "data": {"tool_use_id": "tu_1", "result": "Done", "is_error": false}
            })
        );
    }

    #[test]
    fn test_status_omits_missing_session_id() {
        let value = serde_json::to_value(ServerEvent::status(StatusKind::AwaitingApproval)).unwrap();
        assert_eq!(
            value,
            json!({"type": "status", "data": {"status": "awaiting_approval"}})
        );

        let value =
            serde_json::to_value(ServerEvent::status_for(StatusKind::Connected, "abc")).unwrap();
        assert_eq!(
            value,
            json!({"type": "status", "data": {"status": "connected", "session_id": "abc"}})
        );
    }

    #[test]
    fn test_result_usage_optional() {
        let value = serde_json::to_value(ServerEvent::Result {
            cost: 0.25,
            usage: None,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "result", "data": {"cost": 0.25}}));
    }

    #[test]
    fn test_is_persisted() {
        assert!(ServerEvent::error("boom").is_persisted());
        assert!(
            ServerEvent::AssistantText {
                text: "hi".to_string()
            }
            .is_persisted()
        );
        assert!(!ServerEvent::status(StatusKind::Done).is_persisted());
        assert!(!ServerEvent::History { messages: vec![] }.is_persisted());
        assert!(
            !ServerEvent::ApprovalRequest {
                tool_name: "Bash".to_string(),
                tool_input: json!({})
            }
            .is_persisted()
        );
    }

    #[test]
    fn test_record_from_server_event() {
        let event = ServerEvent::ToolUse {
            tool_use_id: "tu_9".to_string(),
            tool_name: "Bash".to_string(),
            tool_input: json!({"command": "ls"}),
        };
        let record = EventRecord::from_server(&event).unwrap();
        assert_eq!(record.kind, "tool_use");
        assert_eq!(
            record.data,
            json!({"tool_use_id": "tu_9", "tool_name": "Bash", "tool_input": {"command": "ls"}})
        );
    }

    #[test]
    fn test_record_user_message() {
        let record = EventRecord::user_message(&UserMessage::text("list files"));
        assert_eq!(record.kind, "user_message");
        assert_eq!(record.data, json!({"content": "list files", "file_paths": null}));
    }

    #[test]
    fn test_record_serializes_type_field() {
        let record = EventRecord::new("error", json!({"message": "x"}));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["message"], "x");
        assert!(value["timestamp"].is_string());
    }
}
