//! Claude Agent Gateway
//!
//! A websocket gateway that lets a human operator drive a Claude Code agent
//! session: stream its output, approve or deny gated tool calls, interrupt
//! or redirect it mid-turn, and rejoin the session later with its history.
//!
//! ## Features
//!
//! - One orchestrator per session driving a long-lived `claude` subprocess
//! - Approval gate with a 300 s timeout for every non read-only tool
//! - Interrupt and redirect while a turn is in flight
//! - Durable session log (SQLite) replayed on reconnect, six hour retention
//!
//! ## Quick Start
//!
//! ```no_run
//! use claude_agent_gateway::{Cli, run_gateway_with_cli};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cli = Cli::default();
//!     run_gateway_with_cli(&cli, async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await
//! }
//! ```
//!
//! ## Wire protocol
//!
//! Connect to `GET /ws?session_id=<id>` and exchange JSON text frames of the
//! form `{"type": ..., "data": {...}}`:
//!
//! - client: `user_message`, `approval_response`, `interrupt`, `clear_session`
//! - server: `assistant_text`, `thinking`, `tool_use`, `tool_result`,
//!   `approval_request`, `result`, `error`, `status`, `history`
//!
//! ## Environment Variables
//!
//! - `ANTHROPIC_BASE_URL`: Custom API base URL
//! - `ANTHROPIC_API_KEY`: API key (preferred)
//! - `ANTHROPIC_AUTH_TOKEN`: Auth token (legacy, fallback)
//! - `ANTHROPIC_MODEL`: Model to use
//! - `ANTHROPIC_SMALL_FAST_MODEL`: Model for fast operations
//! - `MAX_THINKING_TOKENS`: Maximum tokens for extended thinking mode
//! - `GATEWAY_BIND`, `GATEWAY_PORT`, `GATEWAY_STORE`, `CLAUDE_CODE_PATH`:
//!   defaults for the matching command-line flags

pub mod app;
pub mod cli;
pub mod converter;
pub mod engine;
pub mod gateway;
pub mod protocol;
pub mod session;
pub mod store;
pub mod tracing;
pub mod types;

pub use app::{GatewayApp, run_gateway, run_gateway_with_cli, shutdown_otel};
pub use cli::Cli;
pub use engine::{AgentClient, AgentConnector, ClaudeSdkConnector, EngineOptions};
pub use protocol::{ClientEvent, ServerEvent, StatusKind};
pub use session::{AgentSessionState, Orchestrator, SessionRegistry};
pub use store::{SessionLog, SessionStore};
pub use types::{AgentConfig, AgentError, GatewayConfig, Result};
