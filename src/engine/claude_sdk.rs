//! Claude Agent SDK engine
//!
//! Each client owns one [`ClaudeClient`]. A query spawns a pump task that
//! forwards the SDK's response stream into the client's event channel. Tool
//! permission prompts arrive through the SDK's `can_use_tool` callback, which
//! parks on a oneshot and surfaces as an [`EngineEvent::PermissionRequest`]
//! in that same channel, so the orchestrator reads one ordered stream.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use claude_code_agent_sdk::{
    CanUseToolCallback, ClaudeAgentOptions, ClaudeClient, ClaudeError, Message, PermissionResult,
    SystemPrompt, SystemPromptPreset, ToolPermissionContext,
};
use dashmap::DashMap;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::event::{EngineEvent, PermissionDecision, PermissionRequest};
use super::{AgentClient, AgentConnector, EngineOptions};
use crate::types::{AgentError, Result};

/// Preset the appended system prompt extends
const SYSTEM_PROMPT_PRESET: &str = "claude_code";

/// Deny message for prompts nobody can answer any more
const CLIENT_CLOSED_MESSAGE: &str = "Engine client closed";

type EventSender = mpsc::UnboundedSender<Result<EngineEvent>>;
type PendingPermissions = Arc<DashMap<String, oneshot::Sender<PermissionDecision>>>;

/// Translate engine options into SDK options
pub fn build_options(options: &EngineOptions, can_use_tool: CanUseToolCallback) -> ClaudeAgentOptions {
    let mut sdk = ClaudeAgentOptions::builder()
        .can_use_tool(can_use_tool)
        .build();

    sdk.cli_path = options.program.clone();
    sdk.cwd = options.cwd.clone();
    sdk.model = options.model.clone();
    sdk.fallback_model = options.fallback_model.clone();
    sdk.max_thinking_tokens = options.max_thinking_tokens;
    sdk.allowed_tools = options.allowed_tools.clone();
    sdk.disallowed_tools = options.disallowed_tools.clone();
    sdk.env.extend(options.env.clone());
    sdk.system_prompt = match (&options.system_prompt, &options.append_system_prompt) {
        (Some(prompt), Some(append)) => Some(SystemPrompt::Text(format!("{prompt}\n\n{append}"))),
        (Some(prompt), None) => Some(SystemPrompt::Text(prompt.clone())),
        (None, Some(append)) => Some(SystemPrompt::Preset(SystemPromptPreset::with_append(
            SYSTEM_PROMPT_PRESET,
            append,
        ))),
        (None, None) => None,
    };
    sdk.stderr_callback = Some(Arc::new(|line: String| {
        tracing::debug!(target: "engine_stderr", "{}", line);
    }));

    sdk
}

/// `can_use_tool` callback feeding prompts into the event channel
fn permission_callback(events: EventSender, pending: PendingPermissions) -> CanUseToolCallback {
    Arc::new(
        move |tool_name: String,
              input: Value,
              context: ToolPermissionContext|
              -> BoxFuture<'static, PermissionResult> {
            let events = events.clone();
            let pending = Arc::clone(&pending);

            Box::pin(async move {
                let request_id = uuid::Uuid::new_v4().to_string();
                let (tx, rx) = oneshot::channel();
                pending.insert(request_id.clone(), tx);

                tracing::debug!(
                    request_id = %request_id,
                    tool_name = %tool_name,
                    "Engine asks for tool permission"
                );
                let request = PermissionRequest {
                    request_id: request_id.clone(),
                    tool_name,
                    input,
                    tool_use_id: context.tool_use_id,
                };
                if events
                    .send(Ok(EngineEvent::PermissionRequest(request)))
                    .is_err()
                {
                    pending.remove(&request_id);
                    return closed_denial();
                }

                match rx.await {
                    Ok(decision) => decision.into_result(),
                    Err(_) => closed_denial(),
                }
            })
        },
    )
}

fn closed_denial() -> PermissionResult {
    PermissionDecision::Deny {
        message: CLIENT_CLOSED_MESSAGE.to_string(),
    }
    .into_result()
}

/// Connector creating one SDK client per engine client
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaudeSdkConnector;

impl ClaudeSdkConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentConnector for ClaudeSdkConnector {
    #[instrument(name = "engine_connect", skip_all, fields(cli_path = ?options.program))]
    async fn connect(&self, options: &EngineOptions) -> Result<Arc<dyn AgentClient>> {
        let start = Instant::now();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingPermissions = Arc::new(DashMap::new());
        let callback = permission_callback(events_tx.clone(), Arc::clone(&pending));
        let mut client = ClaudeClient::new(build_options(options, callback));

        match tokio::time::timeout(options.connect_timeout, client.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                drop(client.disconnect().await);
                return Err(e.into());
            }
            Err(_) => {
                drop(client.disconnect().await);
                let ms = u64::try_from(options.connect_timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(AgentError::ConnectionTimeout(ms));
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            "Engine client ready"
        );
        Ok(Arc::new(ClaudeSdkClient {
            client: Arc::new(RwLock::new(client)),
            events_tx,
            events_rx: Mutex::new(events_rx),
            pending,
            pump: parking_lot::Mutex::new(None),
            closed: CancellationToken::new(),
        }))
    }
}

/// Engine client backed by the Agent SDK
pub struct ClaudeSdkClient {
    client: Arc<RwLock<ClaudeClient>>,
    events_tx: EventSender,
    events_rx: Mutex<mpsc::UnboundedReceiver<Result<EngineEvent>>>,
    pending: PendingPermissions,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl fmt::Debug for ClaudeSdkClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaudeSdkClient")
            .field("pending_permissions", &self.pending.len())
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ClaudeSdkClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(AgentError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    /// Forward one query's response stream into the event channel
    ///
    /// The stream ends after the closing `result`; ending earlier is a
    /// stream error for the orchestrator.
    fn spawn_pump(&self) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let client = client.read_owned().await;
            let mut stream = client.receive_response();
            let mut completed = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => {
                        completed = matches!(message, Message::Result(_));
                        if events.send(Ok(EngineEvent::Message(message))).is_err() {
                            return;
                        }
                    }
                    Err(ClaudeError::MessageParse(e)) => {
                        tracing::warn!(error = %e, "Skipping engine message the SDK cannot parse");
                    }
                    Err(e) => {
                        drop(events.send(Err(e.into())));
                        return;
                    }
                }
            }

            if !completed {
                drop(events.send(Err(AgentError::streaming_error(
                    "engine stream ended before the turn completed",
                ))));
            }
        })
    }
}

#[async_trait]
impl AgentClient for ClaudeSdkClient {
    async fn query(&self, prompt: &str) -> Result<()> {
        self.ensure_open()?;
        self.stop_pump();
        self.client.write().await.query(prompt).await?;

        let pump = self.spawn_pump();
        *self.pump.lock() = Some(pump);
        Ok(())
    }

    async fn next_event(&self) -> Option<Result<EngineEvent>> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = self.events_rx.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    async fn respond_permission(
        &self,
        request: &PermissionRequest,
        decision: &PermissionDecision,
    ) -> Result<()> {
        match self.pending.remove(&request.request_id) {
            Some((_, responder)) => {
                if responder.send(decision.clone()).is_err() {
                    tracing::debug!(
                        request_id = %request.request_id,
                        "Engine stopped waiting for this permission answer"
                    );
                }
            }
            None => tracing::debug!(
                request_id = %request.request_id,
                "No engine prompt waiting for this permission answer"
            ),
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.ensure_open()?;
        self.client.read().await.interrupt().await?;
        tracing::debug!("Interrupt sent to engine");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.stop_pump();
        // Dropping the responders denies every parked prompt
        self.pending.clear();
        self.client.write().await.disconnect().await?;
        tracing::debug!("Engine client disconnected");
        Ok(())
    }
}
