//! Frame encoding and decoding
//!
//! Stateless. Decoding goes through a loose `{type, data}` frame first so
//! that unit events (`interrupt`, `clear_session`) accept a missing, null or
//! empty `data` member.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::event::{ClientEvent, ServerEvent};
use crate::types::{AgentError, Result};

/// Preview length for text payloads in logs
const TEXT_PREVIEW_LEN: usize = 100;

/// Preview length for tool inputs in logs
const INPUT_PREVIEW_LEN: usize = 200;

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one client frame
pub fn decode_client(text: &str) -> Result<ClientEvent> {
    let frame: RawFrame = serde_json::from_str(text)
        .map_err(|e| AgentError::invalid_frame(format!("malformed envelope: {e}")))?;

    match frame.kind.as_str() {
        "user_message" => Ok(ClientEvent::UserMessage(payload(&frame)?)),
        "approval_response" => Ok(ClientEvent::ApprovalResponse(payload(&frame)?)),
        "interrupt" => Ok(ClientEvent::Interrupt),
        "clear_session" => Ok(ClientEvent::ClearSession),
        other => Err(AgentError::invalid_frame(format!(
            "unknown event type: {other}"
        ))),
    }
}

fn payload<T: DeserializeOwned>(frame: &RawFrame) -> Result<T> {
    let data = if frame.data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        frame.data.clone()
    };
    serde_json::from_value(data)
        .map_err(|e| AgentError::invalid_frame(format!("bad {} payload: {e}", frame.kind)))
}

/// Encode one server event as a text frame
pub fn encode_server(event: &ServerEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// Truncate a string to at most `max_len` characters, appending "..." when cut
pub fn truncate_string(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Short human-readable summary of an outgoing event
pub fn summarize(event: &ServerEvent) -> String {
    match event {
        ServerEvent::AssistantText { text } => truncate_string(text, TEXT_PREVIEW_LEN),
        ServerEvent::Thinking { thinking } => truncate_string(thinking, TEXT_PREVIEW_LEN),
        ServerEvent::ToolUse {
            tool_name,
            tool_input,
            ..
        }
        | ServerEvent::ApprovalRequest {
            tool_name,
            tool_input,
        } => format!(
            "{tool_name} {}",
            truncate_string(&tool_input.to_string(), INPUT_PREVIEW_LEN)
        ),
        ServerEvent::ToolResult {
            result, is_error, ..
        } => format!(
            "is_error={is_error} {}",
            truncate_string(result, TEXT_PREVIEW_LEN)
        ),
        ServerEvent::Result { cost, .. } => format!("cost=${cost:.4}"),
        ServerEvent::Error { message } => truncate_string(message, TEXT_PREVIEW_LEN),
        ServerEvent::Status { status, session_id } => match session_id {
            Some(id) => format!("{status:?} session_id={id}"),
            None => format!("{status:?}"),
        },
        ServerEvent::History { messages } => format!("{} messages", messages.len()),
    }
}

/// Trace an outgoing event at DEBUG with a truncated summary
pub fn trace_outgoing(session_id: &str, event: &ServerEvent) {
    tracing::debug!(
        session_id = %session_id,
        event_type = event.kind(),
        summary = %summarize(event),
        "Outgoing event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ApprovalResponse, StatusKind, UserMessage};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_user_message() {
        let event = decode_client(r#"{"type":"user_message","data":{"content":"list files"}}"#)
            .unwrap();
        assert_eq!(event, ClientEvent::UserMessage(UserMessage::text("list files")));
    }

    #[test]
    fn test_decode_user_message_with_files() {
        let event = decode_client(
            r#"{"type":"user_message","data":{"content":"summarize","file_paths":["/tmp/a.md","/tmp/b.md"]}}"#,
        )
        .unwrap();
        let ClientEvent::UserMessage(message) = event else {
            panic!("expected user_message");
        };
        assert_eq!(message.attachments().len(), 2);
        assert_eq!(message.content, "summarize");
    }

    #[test]
    fn test_decode_approval_response() {
        let event = decode_client(
            r#"{"type":"approval_response","data":{"approved":false,"reason":"no"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::ApprovalResponse(ApprovalResponse {
                approved: false,
                reason: Some("no".to_string()),
            })
        );
    }

    #[test]
    fn test_decode_unit_events_accept_any_data() {
        for frame in [
            r#"{"type":"interrupt"}"#,
            r#"{"type":"interrupt","data":{}}"#,
            r#"{"type":"interrupt","data":null}"#,
        ] {
            assert_eq!(decode_client(frame).unwrap(), ClientEvent::Interrupt);
        }
        assert_eq!(
            decode_client(r#"{"type":"clear_session","data":{}}"#).unwrap(),
            ClientEvent::ClearSession
        );
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(
            decode_client("not json"),
            Err(AgentError::InvalidFrame(_))
        ));
        assert!(matches!(
            decode_client(r#"{"data":{}}"#),
            Err(AgentError::InvalidFrame(_))
        ));
        assert!(matches!(
            decode_client(r#"{"type":"explode","data":{}}"#),
            Err(AgentError::InvalidFrame(_))
        ));
        assert!(matches!(
            decode_client(r#"{"type":"approval_response","data":{"approved":"yes"}}"#),
            Err(AgentError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_encode_server() {
        let text = encode_server(&ServerEvent::status(StatusKind::Done)).unwrap();
        assert_eq!(text, r#"{"type":"status","data":{"status":"done"}}"#);
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("hello world", 5), "hello...");
        assert_eq!(truncate_string("héllo wörld", 4), "héll...");
    }

    #[test]
    fn test_summarize() {
        let event = ServerEvent::ApprovalRequest {
            tool_name: "Bash".to_string(),
            tool_input: serde_json::json!({"command": "ls"}),
        };
        assert_eq!(summarize(&event), r#"Bash {"command":"ls"}"#);
        assert_eq!(
            summarize(&ServerEvent::Result {
                cost: 0.5,
                usage: None
            }),
            "cost=$0.5000"
        );
    }
}
