//! Engine message to server event conversion
//!
//! Assistant content blocks become `assistant_text`, `thinking` and
//! `tool_use` events, tool results fed back to the model become
//! `tool_result` events, and the turn summary becomes `result`.

use std::time::Instant;

use claude_code_agent_sdk::{ContentBlock, Message, ResultMessage, ToolResultContent, UserMessage};
use dashmap::DashMap;
use serde_json::Value;

use crate::protocol::ServerEvent;

/// Reported for a tool that finished without output
const EMPTY_RESULT: &str = "Done";

/// Converts engine stream messages into server events
///
/// Remembers tool names by `tool_use_id` so that failing tool results can be
/// logged with the tool that produced them.
#[derive(Debug, Default)]
pub struct EventConverter {
    tool_names: DashMap<String, String>,
}

impl EventConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert one engine message; bookkeeping messages produce nothing
    pub fn convert(&self, message: &Message, session_id: &str) -> Vec<ServerEvent> {
        let start_time = Instant::now();

        let (message_type, events) = match message {
            Message::Assistant(assistant) => (
                "assistant",
                self.convert_blocks(&assistant.message.content, session_id),
            ),
            Message::User(user) => ("user", self.convert_blocks(&user_blocks(user), session_id)),
            Message::Result(result) => ("result", Self::convert_result(result)),
            Message::System(_) => ("system", Vec::new()),
            Message::StreamEvent(_) => ("stream_event", Vec::new()),
            Message::ControlCancelRequest(_) => ("control_cancel_request", Vec::new()),
        };

        tracing::trace!(
            message_type,
            session_id = %session_id,
            output_count = events.len(),
            conversion_duration_us = start_time.elapsed().as_micros(),
            "Message conversion completed"
        );

        events
    }

    /// Forget cached tool names, e.g. after the session was cleared
    pub fn reset(&self) {
        self.tool_names.clear();
    }

    fn convert_blocks(&self, blocks: &[ContentBlock], session_id: &str) -> Vec<ServerEvent> {
        blocks
            .iter()
            .filter_map(|block| self.convert_block(block, session_id))
            .collect()
    }

    fn convert_block(&self, block: &ContentBlock, session_id: &str) -> Option<ServerEvent> {
        match block {
            ContentBlock::Text(text) => Some(ServerEvent::AssistantText {
                text: text.text.clone(),
            }),
            ContentBlock::Thinking(thinking) => Some(ServerEvent::Thinking {
                thinking: thinking.thinking.clone(),
            }),
            ContentBlock::ToolUse(tool_use) => {
                self.tool_names
                    .insert(tool_use.id.clone(), tool_use.name.clone());
                Some(ServerEvent::ToolUse {
                    tool_use_id: tool_use.id.clone(),
                    tool_name: tool_use.name.clone(),
                    tool_input: tool_use.input.clone(),
                })
            }
            ContentBlock::ToolResult(tool_result) => {
                let is_error = tool_result.is_error.unwrap_or(false);
                let mut result = tool_result
                    .content
                    .as_ref()
                    .map(result_text)
                    .unwrap_or_default();
                if result.is_empty() {
                    result = EMPTY_RESULT.to_string();
                }

                let tool_name = self
                    .tool_names
                    .remove(&tool_result.tool_use_id)
                    .map(|(_, name)| name);
                if is_error {
                    tracing::warn!(
                        session_id = %session_id,
                        tool_use_id = %tool_result.tool_use_id,
                        tool_name = tool_name.as_deref().unwrap_or("unknown"),
                        "Tool reported an error"
                    );
                }

                Some(ServerEvent::ToolResult {
                    tool_use_id: tool_result.tool_use_id.clone(),
                    result,
                    is_error,
                })
            }
            ContentBlock::Image(_) => None,
        }
    }

    fn convert_result(result: &ResultMessage) -> Vec<ServerEvent> {
        let mut events = Vec::with_capacity(2);
        if result.is_error {
            if let Some(message) = result.result.as_deref().filter(|m| !m.is_empty()) {
                events.push(ServerEvent::error(message));
            }
        }
        events.push(ServerEvent::Result {
            cost: result.total_cost_usd.unwrap_or(0.0),
            usage: result.usage.clone(),
        });
        events
    }
}

/// Content blocks of a user message
///
/// The SDK fills `content` for messages it builds itself; messages read from
/// the CLI keep their body under `message.content`, where a plain string is
/// the prompt echoed back and yields no blocks.
fn user_blocks(user: &UserMessage) -> Vec<ContentBlock> {
    if let Some(content) = &user.content {
        return content.clone();
    }
    match user.extra.pointer("/message/content") {
        Some(content @ Value::Array(_)) => {
            serde_json::from_value(content.clone()).unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Skipping user content the converter cannot read");
                Vec::new()
            })
        }
        _ => Vec::new(),
    }
}

/// Flatten tool output; list parts contribute their `text` members
fn result_text(content: &ToolResultContent) -> String {
    match content {
        ToolResultContent::Text(text) => text.clone(),
        ToolResultContent::Blocks(parts) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn message(value: Value) -> Message {
        serde_json::from_value(value).unwrap()
    }

    fn result(extra: Value) -> Message {
        let mut value = json!({
            "type": "result",
            "subtype": "success",
            "duration_ms": 1200,
            "duration_api_ms": 900,
            "is_error": false,
            "num_turns": 1,
            "session_id": "engine-session"
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        message(value)
    }

    #[test]
    fn test_convert_assistant_blocks() {
        let converter = EventConverter::new();
        let events = converter.convert(
            &message(json!({
                "type": "assistant",
                "message": {
                    "model": "claude-sonnet",
                    "content": [
                        {"type": "thinking", "thinking": "let me look", "signature": "sig"},
                        {"type": "text", "text": "Listing files"},
                        {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"command": "ls"}}
                    ]
                },
                "parent_tool_use_id": null
            })),
            "s1",
        );

        assert_eq!(
            events,
            vec![
                ServerEvent::Thinking {
                    thinking: "let me look".to_string()
                },
                ServerEvent::AssistantText {
                    text: "Listing files".to_string()
                },
                ServerEvent::ToolUse {
                    tool_use_id: "tu_1".to_string(),
                    tool_name: "Bash".to_string(),
                    tool_input: json!({"command": "ls"}),
                },
            ]
        );
    }

    #[test]
    fn test_convert_cli_tool_result() {
        let converter = EventConverter::new();
        let events = converter.convert(
            &message(json!({
                "type": "user",
                "message": {
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": "tu_1",
                        "content": [
                            {"type": "text", "text": "a.txt"},
                            {"type": "image", "source": {}},
                            {"type": "text", "text": "b.txt"}
                        ],
                        "is_error": false
                    }]
                },
                "parent_tool_use_id": null,
                "session_id": "engine-session"
            })),
            "s1",
        );
        assert_eq!(
            events,
            vec![ServerEvent::ToolResult {
                tool_use_id: "tu_1".to_string(),
                result: "a.txt\nb.txt".to_string(),
                is_error: false,
            }]
        );
    }

    #[test]
    fn test_empty_tool_result_reports_done() {
        let converter = EventConverter::new();
        let events = converter.convert(
            &message(json!({
                "type": "user",
                "message": {
                    "content": [{"type": "tool_result", "tool_use_id": "tu_2", "is_error": true}]
                }
            })),
            "s1",
        );
        assert_eq!(
            events,
            vec![ServerEvent::ToolResult {
                tool_use_id: "tu_2".to_string(),
                result: "Done".to_string(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn test_convert_result() {
        let converter = EventConverter::new();
        let events = converter.convert(
            &result(json!({"total_cost_usd": 0.25, "usage": {"output_tokens": 5}})),
            "s1",
        );
        assert_eq!(
            events,
            vec![ServerEvent::Result {
                cost: 0.25,
                usage: Some(json!({"output_tokens": 5})),
            }]
        );
    }

    #[test]
    fn test_error_result_surfaces_message() {
        let converter = EventConverter::new();
        let events = converter.convert(
            &result(json!({
                "subtype": "error_max_turns",
                "is_error": true,
                "result": "Reached max turns"
            })),
            "s1",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ServerEvent::error("Reached max turns"));
        assert_eq!(events[1], ServerEvent::Result { cost: 0.0, usage: None });
    }

    #[test]
    fn test_bookkeeping_messages_produce_nothing() {
        let converter = EventConverter::new();
        let system = message(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "engine-session",
            "tools": ["Bash", "Read"]
        }));
        assert!(converter.convert(&system, "s1").is_empty());

        // The prompt echoed back as plain text
        let echo = message(json!({"type": "user", "message": {"role": "user", "content": "hi"}}));
        assert!(converter.convert(&echo, "s1").is_empty());
    }
}
