//! Agent execution engine boundary
//!
//! The orchestrator only sees two traits: an [`AgentConnector`] that builds
//! clients, and the [`AgentClient`] it drives for the length of a session.
//! [`ClaudeSdkConnector`] drives Claude Code through the Agent SDK;
//! [`scripted`] provides an in-process engine for tests.

mod claude_sdk;
mod event;
mod lifecycle;
pub mod scripted;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::Result;

pub use claude_sdk::{ClaudeSdkClient, ClaudeSdkConnector, build_options};
pub use event::{EngineEvent, PermissionDecision, PermissionRequest};
pub use lifecycle::{ClientLifecycle, ClientState};

/// Tools that run without asking the operator
///
/// All of them are read-only; everything else goes through the approval gate.
pub const DEFAULT_AUTO_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "Task",
];

/// How to launch and configure an engine client
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Claude Code executable; `None` lets the SDK look it up
    pub program: Option<PathBuf>,
    /// Working directory of the engine
    pub cwd: Option<PathBuf>,
    /// Primary model
    pub model: Option<String>,
    /// Model used when the primary one is overloaded
    pub fallback_model: Option<String>,
    /// Budget for extended thinking
    pub max_thinking_tokens: Option<u32>,
    /// Replaces the engine's default system prompt
    pub system_prompt: Option<String>,
    /// Appended to the engine's system prompt
    pub append_system_prompt: Option<String>,
    /// Tools that skip the approval gate
    pub allowed_tools: Vec<String>,
    /// Tools the engine may never use
    pub disallowed_tools: Vec<String>,
    /// Extra environment for the engine process
    pub env: HashMap<String, String>,
    /// Upper bound for starting the engine and its handshake
    pub connect_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            program: None,
            cwd: None,
            model: None,
            fallback_model: None,
            max_thinking_tokens: None,
            system_prompt: None,
            append_system_prompt: None,
            allowed_tools: DEFAULT_AUTO_ALLOWED_TOOLS
                .iter()
                .map(|t| (*t).to_string())
                .collect(),
            disallowed_tools: Vec::new(),
            env: HashMap::new(),
            connect_timeout: Duration::from_secs(60),
        }
    }
}

/// A connected engine session
///
/// Methods take `&self` so that the turn task can wait on `next_event`
/// while the receive loop sends an interrupt.
#[async_trait]
pub trait AgentClient: Send + Sync + fmt::Debug {
    /// Submit one user turn
    async fn query(&self, prompt: &str) -> Result<()>;

    /// Next stream item; `None` once the engine has gone away
    async fn next_event(&self) -> Option<Result<EngineEvent>>;

    /// Answer a permission request
    async fn respond_permission(
        &self,
        request: &PermissionRequest,
        decision: &PermissionDecision,
    ) -> Result<()>;

    /// Ask the engine to stop the current turn
    async fn interrupt(&self) -> Result<()>;

    /// Shut the engine down
    async fn disconnect(&self) -> Result<()>;
}

/// Factory for engine clients
#[async_trait]
pub trait AgentConnector: Send + Sync + fmt::Debug {
    async fn connect(&self, options: &EngineOptions) -> Result<Arc<dyn AgentClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = EngineOptions::default();
        assert!(options.program.is_none());
        assert!(options.max_thinking_tokens.is_none());
        assert!(options.allowed_tools.iter().any(|t| t == "Read"));
        assert!(!options.allowed_tools.iter().any(|t| t == "Bash"));
        assert!(options.disallowed_tools.is_empty());
    }
}
