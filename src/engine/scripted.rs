//! Scripted in-process engine
//!
//! A connector whose clients never reason: every call the orchestrator
//! makes is recorded as a [`ScriptCall`], and whatever the driver pushes is
//! handed out by `next_event`. Used by the crate's tests and handy for
//! exercising the gateway without a `claude` binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use claude_code_agent_sdk::{
    AssistantMessage, AssistantMessageInner, ContentBlock, Message, ResultMessage, TextBlock,
    ThinkingBlock, ToolResultBlock, ToolResultContent, ToolUseBlock, UserMessage,
};
use serde_json::Value;
use tokio::sync::mpsc;

use super::event::{EngineEvent, PermissionDecision, PermissionRequest};
use super::{AgentClient, AgentConnector, EngineOptions};
use crate::types::{AgentError, Result};

/// One call made against the scripted engine
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCall {
    /// A client was created; carries its sequence number (1-based)
    Connect(usize),
    Query(String),
    Permission {
        request_id: String,
        decision: PermissionDecision,
    },
    Interrupt,
    Disconnect,
}

type EventSender = mpsc::UnboundedSender<Result<EngineEvent>>;

#[derive(Debug)]
struct Shared {
    calls_tx: mpsc::UnboundedSender<ScriptCall>,
    calls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptCall>>,
    current: parking_lot::Mutex<Option<Arc<ScriptedClient>>>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    result_on_interrupt: Arc<AtomicBool>,
}

/// Connector handing out [`ScriptedClient`]s
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                calls_tx,
                calls_rx: tokio::sync::Mutex::new(calls_rx),
                current: parking_lot::Mutex::new(None),
                connects: AtomicUsize::new(0),
                failing_connects: AtomicUsize::new(0),
                result_on_interrupt: Arc::new(AtomicBool::new(true)),
            }),
        }
    }

    /// Make the next connect attempt fail
    pub fn fail_next_connect(&self) {
        self.shared.failing_connects.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether an interrupt makes the client emit a closing `result`
    /// (default true, like the real engine)
    pub fn set_result_on_interrupt(&self, enabled: bool) {
        self.shared
            .result_on_interrupt
            .store(enabled, Ordering::SeqCst);
    }

    /// Number of clients created so far
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Wait for the next recorded call
    pub async fn next_call(&self) -> Option<ScriptCall> {
        self.shared.calls_rx.lock().await.recv().await
    }

    /// Next recorded call if one is already queued
    pub fn try_next_call(&self) -> Option<ScriptCall> {
        self.shared.calls_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Feed an event to the most recent client; false if there is none
    pub fn push(&self, event: EngineEvent) -> bool {
        self.send(Ok(event))
    }

    /// Feed a stream error to the most recent client
    pub fn push_error(&self, error: AgentError) -> bool {
        self.send(Err(error))
    }

    /// End the most recent client's stream, as if the engine died
    pub fn close_stream(&self) {
        if let Some(client) = self.shared.current.lock().as_ref() {
            client.events_tx.lock().take();
        }
    }

    fn send(&self, item: Result<EngineEvent>) -> bool {
        let current = self.shared.current.lock();
        let Some(client) = current.as_ref() else {
            return false;
        };
        let sender = client.events_tx.lock();
        sender.as_ref().is_some_and(|tx| tx.send(item).is_ok())
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn connect(&self, _options: &EngineOptions) -> Result<Arc<dyn AgentClient>> {
        let failing = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AgentError::connection_failed("scripted connect failure"));
        }

        let id = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Arc::new(ScriptedClient {
            events_tx: parking_lot::Mutex::new(Some(events_tx)),
            events_rx: tokio::sync::Mutex::new(events_rx),
            calls: self.shared.calls_tx.clone(),
            result_on_interrupt: Arc::clone(&self.shared.result_on_interrupt),
            disconnected: AtomicBool::new(false),
        });
        *self.shared.current.lock() = Some(Arc::clone(&client));
        drop(self.shared.calls_tx.send(ScriptCall::Connect(id)));
        Ok(client)
    }
}

/// Client created by [`ScriptedConnector`]
#[derive(Debug)]
pub struct ScriptedClient {
    events_tx: parking_lot::Mutex<Option<EventSender>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<EngineEvent>>>,
    calls: mpsc::UnboundedSender<ScriptCall>,
    result_on_interrupt: Arc<AtomicBool>,
    disconnected: AtomicBool,
}

impl ScriptedClient {
    fn record(&self, call: ScriptCall) {
        drop(self.calls.send(call));
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(AgentError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AgentClient for ScriptedClient {
    async fn query(&self, prompt: &str) -> Result<()> {
        self.ensure_connected()?;
        self.record(ScriptCall::Query(prompt.to_string()));
        Ok(())
    }

    async fn next_event(&self) -> Option<Result<EngineEvent>> {
        if self.disconnected.load(Ordering::SeqCst) {
            return None;
        }
        self.events_rx.lock().await.recv().await
    }

    async fn respond_permission(
        &self,
        request: &PermissionRequest,
        decision: &PermissionDecision,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.record(ScriptCall::Permission {
            request_id: request.request_id.clone(),
            decision: decision.clone(),
        });
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.ensure_connected()?;
        self.record(ScriptCall::Interrupt);
        if self.result_on_interrupt.load(Ordering::SeqCst) {
            if let Some(tx) = self.events_tx.lock().as_ref() {
                drop(tx.send(Ok(result_with(result_message("error_during_execution")))));
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.record(ScriptCall::Disconnect);
            self.events_tx.lock().take();
        }
        Ok(())
    }
}

// === Event builders ===

/// Assistant text block
pub fn text(text: &str) -> EngineEvent {
    assistant(ContentBlock::Text(TextBlock {
        text: text.to_string(),
    }))
}

/// Assistant thinking block
pub fn thinking(thinking: &str) -> EngineEvent {
    assistant(ContentBlock::Thinking(ThinkingBlock {
        thinking: thinking.to_string(),
        signature: String::new(),
    }))
}

/// Assistant tool use block
pub fn tool_use(id: &str, name: &str, input: Value) -> EngineEvent {
    assistant(ContentBlock::ToolUse(ToolUseBlock {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }))
}

/// Tool result fed back to the model
pub fn tool_result(tool_use_id: &str, output: &str, is_error: bool) -> EngineEvent {
    EngineEvent::Message(Message::User(UserMessage {
        text: None,
        content: Some(vec![ContentBlock::ToolResult(ToolResultBlock {
            tool_use_id: tool_use_id.to_string(),
            content: Some(ToolResultContent::Text(output.to_string())),
            is_error: Some(is_error),
        })]),
        uuid: None,
        parent_tool_use_id: None,
        tool_use_result: None,
        extra: Value::Null,
    }))
}

/// Successful turn summary
pub fn result(cost: f64) -> EngineEvent {
    result_with(ResultMessage {
        total_cost_usd: Some(cost),
        ..result_message("success")
    })
}

/// Arbitrary turn summary
pub fn result_with(message: ResultMessage) -> EngineEvent {
    EngineEvent::Message(Message::Result(message))
}

/// Bare turn summary with the given subtype, to be adjusted by the caller
pub fn result_message(subtype: &str) -> ResultMessage {
    ResultMessage {
        subtype: subtype.to_string(),
        duration_ms: 0,
        duration_api_ms: 0,
        is_error: false,
        num_turns: 1,
        session_id: "scripted".to_string(),
        total_cost_usd: None,
        usage: None,
        result: None,
        structured_output: None,
    }
}

/// Permission prompt for a gated tool
pub fn permission(request_id: &str, tool_name: &str, input: Value) -> EngineEvent {
    EngineEvent::PermissionRequest(PermissionRequest {
        request_id: request_id.to_string(),
        tool_name: tool_name.to_string(),
        input,
        tool_use_id: None,
    })
}

fn assistant(block: ContentBlock) -> EngineEvent {
    EngineEvent::Message(Message::Assistant(AssistantMessage {
        message: AssistantMessageInner {
            content: vec![block],
            model: None,
            id: None,
            stop_reason: None,
            usage: None,
            error: None,
        },
        parent_tool_use_id: None,
        session_id: None,
        uuid: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_round_trip() {
        let connector = ScriptedConnector::new();
        assert!(!connector.push(text("nobody listening")));

        let client = connector.connect(&EngineOptions::default()).await.unwrap();
        assert_eq!(connector.next_call().await, Some(ScriptCall::Connect(1)));

        client.query("hello").await.unwrap();
        assert_eq!(
            connector.next_call().await,
            Some(ScriptCall::Query("hello".to_string()))
        );

        assert!(connector.push(text("hi")));
        match client.next_event().await.unwrap().unwrap() {
            EngineEvent::Message(Message::Assistant(message)) => {
                assert!(matches!(
                    &message.message.content[..],
                    [ContentBlock::Text(block)] if block.text == "hi"
                ));
            }
            other => panic!("expected assistant text, got {other:?}"),
        }
        assert!(connector.try_next_call().is_none());
    }

    #[tokio::test]
    async fn test_scripted_interrupt_emits_result() {
        let connector = ScriptedConnector::new();
        let client = connector.connect(&EngineOptions::default()).await.unwrap();

        client.interrupt().await.unwrap();
        let event = client.next_event().await.unwrap().unwrap();
        assert!(event.is_result());

        connector.set_result_on_interrupt(false);
        client.interrupt().await.unwrap();
        connector.push(permission("p1", "Bash", json!({})));
        let event = client.next_event().await.unwrap().unwrap();
        assert!(matches!(event, EngineEvent::PermissionRequest(_)));
    }

    #[tokio::test]
    async fn test_scripted_connect_failure_and_disconnect() {
        let connector = ScriptedConnector::new();
        connector.fail_next_connect();
        assert!(connector.connect(&EngineOptions::default()).await.is_err());
        assert_eq!(connector.connect_count(), 0);

        let client = connector.connect(&EngineOptions::default()).await.unwrap();
        assert_eq!(connector.connect_count(), 1);

        client.disconnect().await.unwrap();
        assert!(client.next_event().await.is_none());
        assert!(matches!(
            client.query("late").await,
            Err(AgentError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_stream() {
        let connector = ScriptedConnector::new();
        let client = connector.connect(&EngineOptions::default()).await.unwrap();
        connector.push(text("last words"));
        connector.close_stream();

        assert!(client.next_event().await.unwrap().is_ok());
        assert!(client.next_event().await.is_none());
    }
}
