//! Agent session orchestrator
//!
//! One orchestrator per session. Three activities touch it concurrently:
//! the connection's receive loop, the turn task consuming the engine stream,
//! and the approval timer running inside that task. Everything they share
//! lives in [`Core`] behind one short-held mutex that is never held across
//! an await point.
//!
//! Emission is write-then-send and serialized by a second, async mutex so
//! that the log order and the wire order are the same. Events scoped to a
//! turn are dropped once that turn is no longer current; this is how output
//! of an interrupted or cleared turn is suppressed.

use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use claude_code_agent_sdk::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::approval::{ApprovalDecision, PendingApproval};
use super::registry::SessionMap;
use super::state::AgentSessionState;
use crate::converter::{EventConverter, PromptConverter};
use crate::engine::{
    AgentClient, AgentConnector, ClientLifecycle, EngineEvent, EngineOptions, PermissionRequest,
};
use crate::protocol::{
    ApprovalResponse, ClientEvent, EventRecord, ServerEvent, StatusKind, UserMessage,
    trace_outgoing,
};
use crate::store::SessionLog;
use crate::tracing::ErrorTraceExt;
use crate::types::{AgentError, OrchestratorSettings, Result};

/// Collaborators shared by every orchestrator of a registry
#[derive(Debug, Clone)]
pub struct SessionDeps {
    pub log: SessionLog,
    pub connector: Arc<dyn AgentConnector>,
    pub engine: EngineOptions,
    pub settings: OrchestratorSettings,
}

/// Mint a fresh session identifier
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy)]
enum Scope {
    /// Always delivered
    Session,
    /// Delivered only while this turn is current
    Turn(u64),
}

#[derive(Debug)]
enum TurnOutcome {
    Completed,
    Failed(AgentError),
    Cancelled,
}

#[derive(Debug)]
struct Turn {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Query submitted and its closing `result` not seen yet
    awaiting_result: bool,
    /// Engine permission request held by the approval gate
    permission: Option<PermissionRequest>,
}

#[derive(Debug)]
struct Outbound {
    binding: u64,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Debug)]
struct Core {
    session_id: String,
    created_at: DateTime<Utc>,
    state: AgentSessionState,
    state_tx: watch::Sender<AgentSessionState>,
    pending_approval: Option<PendingApproval>,
    pending_message: Option<UserMessage>,
    turn: Option<Turn>,
    next_turn: u64,
    next_approval: u64,
    client: ClientLifecycle,
    outbound: Option<Outbound>,
    bindings: u64,
    closed: bool,
}

impl Core {
    fn set_state(&mut self, state: AgentSessionState) {
        if self.state != state {
            tracing::debug!(
                session_id = %self.session_id,
                from = %self.state,
                to = %state,
                "Session state transition"
            );
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn is_current(&self, turn: u64) -> bool {
        self.turn.as_ref().is_some_and(|t| t.id == turn)
    }

    fn current_turn_mut(&mut self, turn: u64) -> Option<&mut Turn> {
        self.turn.as_mut().filter(|t| t.id == turn)
    }

    fn accepts(&self, scope: Scope) -> bool {
        match scope {
            Scope::Session => true,
            Scope::Turn(id) => self.is_current(id),
        }
    }
}

/// What an interrupt took away from the session, handed to the settle task
#[derive(Debug)]
struct Preempted {
    turn: Option<Turn>,
    client: Option<Arc<dyn AgentClient>>,
}

#[derive(Debug)]
struct Inner {
    core: Mutex<Core>,
    emitter: AsyncMutex<()>,
    deps: SessionDeps,
    converter: EventConverter,
    prompts: PromptConverter,
    registry: Weak<SessionMap>,
}

/// Handle to one session's orchestrator; clones share the session
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Standalone orchestrator, not listed in any registry
    pub fn new(session_id: impl Into<String>, deps: SessionDeps) -> Self {
        Self::with_registry(session_id.into(), deps, Weak::new())
    }

    pub(crate) fn with_registry(
        session_id: String,
        deps: SessionDeps,
        registry: Weak<SessionMap>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AgentSessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    session_id,
                    created_at: Utc::now(),
                    state: AgentSessionState::Idle,
                    state_tx,
                    pending_approval: None,
                    pending_message: None,
                    turn: None,
                    next_turn: 0,
                    next_approval: 0,
                    client: ClientLifecycle::new(),
                    outbound: None,
                    bindings: 0,
                    closed: false,
                }),
                emitter: AsyncMutex::new(()),
                deps,
                converter: EventConverter::new(),
                prompts: PromptConverter::new(),
                registry,
            }),
        }
    }

    // === Observers ===

    pub fn session_id(&self) -> String {
        self.inner.core.lock().session_id.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.core.lock().created_at
    }

    pub fn state(&self) -> AgentSessionState {
        self.inner.core.lock().state
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<AgentSessionState> {
        self.inner.core.lock().state_tx.subscribe()
    }

    pub fn has_pending_approval(&self) -> bool {
        self.inner.core.lock().pending_approval.is_some()
    }

    pub fn has_pending_message(&self) -> bool {
        self.inner.core.lock().pending_message.is_some()
    }

    /// Whether a connection is currently bound
    pub fn is_attached(&self) -> bool {
        self.inner.core.lock().outbound.is_some()
    }

    /// Number of attaches so far; changes whenever a connection binds
    pub fn binding_generation(&self) -> u64 {
        self.inner.core.lock().bindings
    }

    /// Whether the orchestrator was shut down (or claimed for eviction)
    pub fn is_closed(&self) -> bool {
        self.inner.core.lock().closed
    }

    pub fn same_as(&self, other: &Orchestrator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Persisted history of the current session identifier
    pub async fn history(&self) -> Vec<EventRecord> {
        self.inner.deps.log.history(&self.session_id()).await
    }

    // === Transport binding ===

    /// Bind a connection's outbound queue and greet it
    ///
    /// Sends `status=connected` and, if there is any, the `history` replay.
    /// Runs under the emitter lock so no event is both replayed and
    /// delivered live, and none falls in between. A newer connection
    /// replaces the previous one; dropping the old sender ends its writer.
    ///
    /// Returns `None`, without greeting, once the orchestrator is closed;
    /// the caller resolves the session again.
    pub async fn attach(&self, tx: mpsc::Sender<ServerEvent>) -> Option<u64> {
        let _guard = self.inner.emitter.lock().await;
        let session_id = self.session_id();
        let history = self.inner.deps.log.history(&session_id).await;

        let binding = {
            let mut core = self.inner.core.lock();
            if core.closed {
                tracing::debug!(session_id = %session_id, "Refusing to bind a closed session");
                return None;
            }
            core.bindings += 1;
            let binding = core.bindings;
            let replaced = core.outbound.replace(Outbound {
                binding,
                tx: tx.clone(),
            });
            if replaced.is_some() {
                tracing::info!(
                    session_id = %session_id,
                    binding,
                    "Newer connection replaces the bound one"
                );
            }
            binding
        };

        let greeting = ServerEvent::status_for(StatusKind::Connected, &session_id);
        trace_outgoing(&session_id, &greeting);
        deliver(&session_id, &tx, greeting);

        if !history.is_empty() {
            tracing::info!(
                session_id = %session_id,
                messages = history.len(),
                "Replaying session history"
            );
            let replay = ServerEvent::History { messages: history };
            trace_outgoing(&session_id, &replay);
            deliver(&session_id, &tx, replay);
        }

        Some(binding)
    }

    /// Close the orchestrator if no connection bound since `generation`
    ///
    /// Checked and marked under the core lock, so a concurrent `attach`
    /// either lands first (and the close is refused) or sees the session
    /// closed and fails. The caller then calls [`shutdown`](Self::shutdown).
    pub fn close_if_unattached(&self, generation: u64) -> bool {
        let mut core = self.inner.core.lock();
        if core.closed || core.outbound.is_some() || core.bindings != generation {
            return false;
        }
        core.closed = true;
        true
    }

    /// Unbind a connection; false if a newer one already took its place
    pub fn detach(&self, binding: u64) -> bool {
        let mut core = self.inner.core.lock();
        if core.outbound.as_ref().is_some_and(|o| o.binding == binding) {
            core.outbound = None;
            true
        } else {
            false
        }
    }

    // === Inbound events ===

    /// Dispatch one decoded client event
    pub async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::UserMessage(message) => self.handle_user_message(message).await,
            ClientEvent::ApprovalResponse(response) => {
                self.handle_approval_response(&response);
            }
            ClientEvent::Interrupt => self.handle_interrupt().await,
            ClientEvent::ClearSession => {
                self.handle_clear_session().await;
            }
        }
    }

    /// Start a turn, or redirect the one in flight
    ///
    /// While a turn runs, the message becomes the single pending message
    /// (replacing any earlier one) and the turn is interrupted; the pending
    /// message is dispatched once the interrupt has settled.
    #[instrument(
        name = "user_message",
        skip_all,
        fields(session_id = %self.session_id(), files = message.attachments().len())
    )]
    pub async fn handle_user_message(&self, message: UserMessage) {
        if message.is_blank() {
            tracing::debug!("Ignoring blank user message");
            return;
        }

        let preempted = {
            let mut core = self.inner.core.lock();
            if core.closed {
                return;
            }
            let state = core.state;
            match state {
                AgentSessionState::Idle => {
                    self.start_turn(&mut core, message);
                    None
                }
                AgentSessionState::Interrupted | AgentSessionState::Error => {
                    // The turn is already unwinding and will pick this up
                    core.pending_message = Some(message);
                    None
                }
                AgentSessionState::Thinking | AgentSessionState::AwaitingApproval => {
                    if core.pending_message.replace(message).is_some() {
                        tracing::debug!("Queued message superseded");
                    }
                    self.preempt(&mut core)
                }
            }
        };

        if let Some(preempted) = preempted {
            tracing::info!("Redirecting: interrupting the turn in flight");
            self.complete_interrupt(preempted).await;
        }
    }

    /// Resolve the pending approval with the operator's decision
    ///
    /// Returns false (and does nothing) if no approval is pending, e.g. a
    /// late answer after the request already timed out.
    pub fn handle_approval_response(&self, response: &ApprovalResponse) -> bool {
        let decision = ApprovalDecision::from_response(response);
        let mut core = self.inner.core.lock();
        match core.pending_approval.take() {
            Some(mut pending) => {
                tracing::info!(
                    session_id = %core.session_id,
                    tool_name = %pending.tool_name,
                    approved = decision.approved,
                    "Operator answered approval request"
                );
                pending.resolve(decision)
            }
            None => {
                tracing::debug!(
                    session_id = %core.session_id,
                    "Approval response with nothing pending, ignoring"
                );
                false
            }
        }
    }

    /// Stop the turn in flight
    ///
    /// No-op when idle or already interrupted. Otherwise the pending
    /// approval is denied, the turn task is cancelled, `status=interrupted`
    /// is emitted once, and a settle task returns the session to idle.
    #[instrument(name = "interrupt", skip_all, fields(session_id = %self.session_id()))]
    pub async fn handle_interrupt(&self) {
        let preempted = {
            let mut core = self.inner.core.lock();
            self.preempt(&mut core)
        };
        match preempted {
            Some(preempted) => self.complete_interrupt(preempted).await,
            None => tracing::debug!("Interrupt ignored, no turn in flight"),
        }
    }

    /// Discard the session log and start over under a new identifier
    ///
    /// Returns the new identifier.
    #[instrument(name = "clear_session", skip_all, fields(session_id = %self.session_id()))]
    pub async fn handle_clear_session(&self) -> String {
        let _guard = self.inner.emitter.lock().await;

        let new_id = new_session_id();
        let (old_id, turn, client) = {
            let mut core = self.inner.core.lock();
            if let Some(mut approval) = core.pending_approval.take() {
                approval.resolve(ApprovalDecision::interrupted());
            }
            core.pending_message = None;
            let turn = core.turn.take();
            let client = core.client.take();
            let old_id = std::mem::replace(&mut core.session_id, new_id.clone());
            core.created_at = Utc::now();
            core.set_state(AgentSessionState::Idle);
            (old_id, turn, client)
        };

        if let Some(turn) = turn {
            abort_turn(turn);
        }
        if let Some(client) = client {
            disconnect_detached(client);
        }
        self.inner.converter.reset();

        self.inner.deps.log.discard(&old_id).await;
        self.inner.deps.log.open(&new_id).await;

        if let Some(sessions) = self.inner.registry.upgrade() {
            sessions.remove_if(&old_id, |_, o| o.same_as(self));
            sessions.insert(new_id.clone(), self.clone());
        }

        tracing::info!(old_session_id = %old_id, new_session_id = %new_id, "Session cleared");
        self.emit_locked(
            Scope::Session,
            ServerEvent::status_for(StatusKind::SessionCleared, &new_id),
        )
        .await;

        new_id
    }

    /// Tear everything down; the orchestrator accepts no further turns
    pub async fn shutdown(&self) {
        let (session_id, turn, client) = {
            let mut core = self.inner.core.lock();
            core.closed = true;
            if let Some(mut approval) = core.pending_approval.take() {
                approval.resolve(ApprovalDecision::interrupted());
            }
            core.pending_message = None;
            core.outbound = None;
            let turn = core.turn.take();
            let client = core.client.take();
            core.set_state(AgentSessionState::Idle);
            (core.session_id.clone(), turn, client)
        };

        if let Some(turn) = turn {
            abort_turn(turn);
        }
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                tracing::debug!(session_id = %session_id, error = %e, "Engine disconnect failed");
            }
        }
        tracing::info!(session_id = %session_id, "Session shut down");
    }

    // === Turn processing ===

    /// Caller holds the core lock and has checked the session is idle
    fn start_turn(&self, core: &mut Core, message: UserMessage) {
        core.next_turn += 1;
        let id = core.next_turn;
        let cancel = CancellationToken::new();
        core.set_state(AgentSessionState::Thinking);

        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { this.run_turn(id, token, message).await });

        core.turn = Some(Turn {
            id,
            cancel,
            task: Some(task),
            awaiting_result: false,
            permission: None,
        });
        tracing::info!(session_id = %core.session_id, turn = id, "Turn started");
    }

    async fn run_turn(&self, turn: u64, cancel: CancellationToken, message: UserMessage) {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => TurnOutcome::Cancelled,
            result = self.drive_turn(turn, &message) => match result {
                Ok(()) => TurnOutcome::Completed,
                Err(AgentError::Cancelled) => TurnOutcome::Cancelled,
                Err(e) => TurnOutcome::Failed(e),
            },
        };
        self.finish_turn(turn, outcome).await;
    }

    async fn drive_turn(&self, turn: u64, message: &UserMessage) -> Result<()> {
        let start_time = Instant::now();
        self.persist(Scope::Turn(turn), EventRecord::user_message(message))
            .await;
        self.emit(Scope::Turn(turn), ServerEvent::status(StatusKind::Thinking))
            .await;

        let client = self.ensure_client().await?;
        let prompt = self.inner.prompts.convert(message);
        self.update_turn(turn, |t| t.awaiting_result = true)?;
        client.query(&prompt).await?;

        loop {
            let item = client.next_event().await.ok_or_else(|| {
                AgentError::streaming_error("engine stream ended before the turn completed")
            })?;

            match item? {
                EngineEvent::PermissionRequest(request) => {
                    let decision = self.request_approval(turn, &request).await?;
                    client
                        .respond_permission(&request, &decision.to_permission())
                        .await?;
                }
                EngineEvent::Message(msg) => {
                    let closes_turn = matches!(msg, Message::Result(_));
                    let session_id = self.session_id();
                    for event in self.inner.converter.convert(&msg, &session_id) {
                        self.emit(Scope::Turn(turn), event).await;
                    }
                    if closes_turn {
                        self.update_turn(turn, |t| t.awaiting_result = false)?;
                        tracing::info!(
                            session_id = %session_id,
                            turn,
                            elapsed_ms = start_time.elapsed().as_millis(),
                            "Turn completed"
                        );
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn finish_turn(&self, turn: u64, outcome: TurnOutcome) {
        let failure = match outcome {
            TurnOutcome::Cancelled => return,
            TurnOutcome::Completed => None,
            TurnOutcome::Failed(error) => Some(error),
        };

        let _guard = self.inner.emitter.lock().await;
        match failure {
            None => {
                self.emit_locked(Scope::Turn(turn), ServerEvent::status(StatusKind::Done))
                    .await;
            }
            Some(error) => {
                let (session_id, client) = {
                    let mut core = self.inner.core.lock();
                    if !core.is_current(turn) {
                        return;
                    }
                    core.set_state(AgentSessionState::Error);
                    (core.session_id.clone(), core.client.take())
                };
                error.trace_session_error(&session_id, "turn");
                self.emit_locked(Scope::Turn(turn), ServerEvent::error(error.to_string()))
                    .await;
                self.emit_locked(Scope::Turn(turn), ServerEvent::status(StatusKind::Error))
                    .await;
                if let Some(client) = client {
                    disconnect_detached(client);
                }
            }
        }

        let mut core = self.inner.core.lock();
        if !core.is_current(turn) {
            return;
        }
        core.turn = None;
        core.set_state(AgentSessionState::Idle);
        if let Some(message) = core.pending_message.take() {
            if !core.closed {
                self.start_turn(&mut core, message);
            }
        }
    }

    /// Connect lazily, reusing the client until it errors
    async fn ensure_client(&self) -> Result<Arc<dyn AgentClient>> {
        let generation = {
            let mut core = self.inner.core.lock();
            if let Some(client) = core.client.current() {
                return Ok(client);
            }
            core.client.begin_connect()
        };

        let session_id = self.session_id();
        let start_time = Instant::now();
        tracing::info!(session_id = %session_id, "Connecting engine client");

        match self.inner.deps.connector.connect(&self.inner.deps.engine).await {
            Ok(client) => {
                let accepted = self
                    .inner
                    .core
                    .lock()
                    .client
                    .complete(generation, Arc::clone(&client));
                if accepted {
                    tracing::info!(
                        session_id = %session_id,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        "Engine client connected"
                    );
                    Ok(client)
                } else {
                    disconnect_detached(client);
                    Err(AgentError::Cancelled)
                }
            }
            Err(e) => {
                self.inner.core.lock().client.fail(generation);
                Err(e)
            }
        }
    }

    fn update_turn(&self, turn: u64, f: impl FnOnce(&mut Turn)) -> Result<()> {
        let mut core = self.inner.core.lock();
        let current = core.current_turn_mut(turn).ok_or(AgentError::Cancelled)?;
        f(current);
        Ok(())
    }

    // === Approval gate ===

    /// Suspend the turn until the operator, an interrupt or the timeout
    /// resolves the request
    async fn request_approval(
        &self,
        turn: u64,
        request: &PermissionRequest,
    ) -> Result<ApprovalDecision> {
        let (approval_id, mut rx) = {
            let mut core = self.inner.core.lock();
            if !core.is_current(turn) {
                return Err(AgentError::Cancelled);
            }
            core.next_approval += 1;
            let id = core.next_approval;
            let (pending, rx) = PendingApproval::new(id, &request.tool_name, request.input.clone());
            if let Some(mut stale) = core.pending_approval.replace(pending) {
                tracing::warn!(
                    session_id = %core.session_id,
                    tool_name = %stale.tool_name,
                    "Replacing an unresolved approval request"
                );
                stale.resolve(ApprovalDecision::interrupted());
            }
            if let Some(current) = core.current_turn_mut(turn) {
                current.permission = Some(request.clone());
            }
            core.set_state(AgentSessionState::AwaitingApproval);
            (id, rx)
        };

        tracing::info!(
            session_id = %self.session_id(),
            tool_name = %request.tool_name,
            request_id = %request.request_id,
            "Waiting for operator approval"
        );
        self.emit(
            Scope::Turn(turn),
            ServerEvent::ApprovalRequest {
                tool_name: request.tool_name.clone(),
                tool_input: request.input.clone(),
            },
        )
        .await;
        self.emit(
            Scope::Turn(turn),
            ServerEvent::status(StatusKind::AwaitingApproval),
        )
        .await;

        let timeout = self.inner.deps.settings.approval_timeout;
        let decision = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => ApprovalDecision::interrupted(),
            Err(_) => self.expire_approval(approval_id, rx).await,
        };

        {
            let mut core = self.inner.core.lock();
            let current = core.current_turn_mut(turn).ok_or(AgentError::Cancelled)?;
            current.permission = None;
            core.set_state(AgentSessionState::Thinking);
        }

        if decision.is_timeout() {
            self.emit(
                Scope::Turn(turn),
                ServerEvent::status(StatusKind::ApprovalTimeout),
            )
            .await;
        }
        self.emit(Scope::Turn(turn), ServerEvent::status(StatusKind::Thinking))
            .await;
        Ok(decision)
    }

    /// The timer fired: claim the approval unless someone resolved it first
    async fn expire_approval(
        &self,
        approval_id: u64,
        rx: oneshot::Receiver<ApprovalDecision>,
    ) -> ApprovalDecision {
        let claimed = {
            let mut core = self.inner.core.lock();
            core.pending_approval.take_if(|p| p.id == approval_id)
        };
        if let Some(mut pending) = claimed {
            tracing::warn!(
                session_id = %self.session_id(),
                tool_name = %pending.tool_name,
                "Approval request timed out, denying"
            );
            pending.resolve(ApprovalDecision::timeout());
        }
        // Whoever resolved first has already sent into `rx`
        rx.await.unwrap_or_else(|_| ApprovalDecision::interrupted())
    }

    // === Interrupt ===

    /// Caller holds the core lock
    ///
    /// Takes over from `thinking`, `awaiting_approval` and `error`; in
    /// `error` the failed turn's remaining output is suppressed and the
    /// settle task, not the failure path, returns the session to idle.
    fn preempt(&self, core: &mut Core) -> Option<Preempted> {
        if matches!(
            core.state,
            AgentSessionState::Idle | AgentSessionState::Interrupted
        ) {
            return None;
        }

        if let Some(mut approval) = core.pending_approval.take() {
            approval.resolve(ApprovalDecision::interrupted());
        }
        let turn = core.turn.take();
        if let Some(turn) = &turn {
            turn.cancel.cancel();
        }
        let client = core.client.current();
        core.set_state(AgentSessionState::Interrupted);
        Some(Preempted { turn, client })
    }

    async fn complete_interrupt(&self, preempted: Preempted) {
        self.emit(Scope::Session, ServerEvent::status(StatusKind::Interrupted))
            .await;
        let this = self.clone();
        tokio::spawn(async move { this.settle(preempted).await });
    }

    /// Let the cancelled turn unwind within the grace period, then go idle
    ///
    /// The engine is told to stop and its stream is drained up to the
    /// closing `result` so the next turn starts clean. An engine that does
    /// not confirm in time is torn down; the next turn reconnects.
    async fn settle(&self, preempted: Preempted) {
        let grace = self.inner.deps.settings.interrupt_grace;
        let session_id = self.session_id();
        let start_time = Instant::now();
        let Preempted { turn, client } = preempted;
        let mut healthy = true;

        if let Some(turn) = turn {
            if let Some(task) = turn.task {
                let abort = task.abort_handle();
                if tokio::time::timeout(grace, task).await.is_err() {
                    tracing::warn!(session_id = %session_id, "Turn task did not unwind, aborting");
                    abort.abort();
                    healthy = false;
                }
            }

            if let (true, true, Some(client)) = (healthy, turn.awaiting_result, client.as_ref()) {
                let unwind = async {
                    if let Some(request) = &turn.permission {
                        client
                            .respond_permission(
                                request,
                                &ApprovalDecision::interrupted().to_permission(),
                            )
                            .await?;
                    }
                    client.interrupt().await?;
                    drain_to_result(client.as_ref()).await
                };
                match tokio::time::timeout(grace, unwind).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %e,
                            "Engine failed to unwind after interrupt"
                        );
                        healthy = false;
                    }
                    Err(_) => {
                        tracing::warn!(
                            session_id = %session_id,
                            grace_ms = grace.as_millis(),
                            "Engine did not confirm the interrupt in time"
                        );
                        healthy = false;
                    }
                }
            }
        }

        if !healthy {
            if let Some(client) = &client {
                let taken = self.inner.core.lock().client.take_if(client);
                if let Some(taken) = taken {
                    disconnect_detached(taken);
                }
            }
        }

        let mut core = self.inner.core.lock();
        if core.state != AgentSessionState::Interrupted || core.turn.is_some() {
            return;
        }
        core.set_state(AgentSessionState::Idle);
        tracing::info!(
            session_id = %core.session_id,
            elapsed_ms = start_time.elapsed().as_millis(),
            "Interrupt settled"
        );
        if let Some(message) = core.pending_message.take() {
            if !core.closed {
                self.start_turn(&mut core, message);
            }
        }
    }

    // === Emission ===

    async fn emit(&self, scope: Scope, event: ServerEvent) {
        let _guard = self.inner.emitter.lock().await;
        self.emit_locked(scope, event).await;
    }

    /// Write-then-send; caller holds the emitter guard
    async fn emit_locked(&self, scope: Scope, event: ServerEvent) {
        let (session_id, tx) = {
            let core = self.inner.core.lock();
            if !core.accepts(scope) {
                tracing::trace!(
                    session_id = %core.session_id,
                    event_type = event.kind(),
                    "Dropping event of a superseded turn"
                );
                return;
            }
            (
                core.session_id.clone(),
                core.outbound.as_ref().map(|o| o.tx.clone()),
            )
        };

        if event.is_persisted() {
            match EventRecord::from_server(&event) {
                Ok(record) => {
                    self.inner.deps.log.append(&session_id, &record).await;
                }
                Err(e) => tracing::warn!(
                    session_id = %session_id,
                    event_type = event.kind(),
                    error = %e,
                    "Failed to encode event for the session log"
                ),
            }
        }

        trace_outgoing(&session_id, &event);
        if let Some(tx) = tx {
            deliver(&session_id, &tx, event);
        }
    }

    /// Persist without sending; used for the operator's own message
    async fn persist(&self, scope: Scope, record: EventRecord) {
        let _guard = self.inner.emitter.lock().await;
        let session_id = {
            let core = self.inner.core.lock();
            if !core.accepts(scope) {
                return;
            }
            core.session_id.clone()
        };
        self.inner.deps.log.append(&session_id, &record).await;
    }
}

fn deliver(session_id: &str, tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => tracing::warn!(
            session_id = %session_id,
            event_type = event.kind(),
            "Outbound queue full, dropping event (history replay recovers it)"
        ),
        Err(TrySendError::Closed(event)) => tracing::debug!(
            session_id = %session_id,
            event_type = event.kind(),
            "Connection gone, event kept in the session log only"
        ),
    }
}

fn abort_turn(turn: Turn) {
    turn.cancel.cancel();
    if let Some(task) = turn.task {
        task.abort();
    }
}

fn disconnect_detached(client: Arc<dyn AgentClient>) {
    tokio::spawn(async move {
        if let Err(e) = client.disconnect().await {
            tracing::debug!(error = %e, "Engine disconnect failed");
        }
    });
}

/// Consume the stream up to the turn's closing `result`
async fn drain_to_result(client: &dyn AgentClient) -> Result<()> {
    loop {
        match client.next_event().await {
            None => {
                return Err(AgentError::streaming_error(
                    "engine stream ended while interrupting",
                ));
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(event)) if event.is_result() => return Ok(()),
            Some(Ok(EngineEvent::PermissionRequest(request))) => {
                client
                    .respond_permission(&request, &ApprovalDecision::interrupted().to_permission())
                    .await?;
            }
            Some(Ok(_)) => {}
        }
    }
}
