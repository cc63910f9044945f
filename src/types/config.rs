//! Gateway and engine configuration
//!
//! `AgentConfig` holds the Anthropic provider settings read from the
//! environment; `GatewayConfig` holds everything the server needs to run.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::types::{AgentError, Result};

/// Default sliding retention window of a durable session log (six hours)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(6 * 60 * 60);

/// Default time an approval request waits for the operator
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bounded settle time after an interrupt
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Default outbound queue depth per connection
pub const DEFAULT_SEND_QUEUE: usize = 256;

/// Agent configuration loaded from environment variables
///
/// Supports configuring alternative model providers through the same
/// variables the Claude Code CLI understands.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Anthropic API base URL
    /// Environment variable: `ANTHROPIC_BASE_URL`
    pub base_url: Option<String>,

    /// API key for authentication
    /// Environment variable: `ANTHROPIC_API_KEY` (preferred) or `ANTHROPIC_AUTH_TOKEN` (legacy)
    pub api_key: Option<String>,

    /// Primary model name
    /// Environment variable: `ANTHROPIC_MODEL`
    pub model: Option<String>,

    /// Small/fast model name (fallback)
    /// Environment variable: `ANTHROPIC_SMALL_FAST_MODEL`
    pub small_fast_model: Option<String>,

    /// Maximum tokens for thinking blocks
    /// Environment variable: `MAX_THINKING_TOKENS`
    pub max_thinking_tokens: Option<u32>,
}

impl AgentConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .or_else(|| std::env::var("ANTHROPIC_AUTH_TOKEN").ok());

        let max_thinking_tokens = std::env::var("MAX_THINKING_TOKENS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok());

        Self {
            base_url: std::env::var("ANTHROPIC_BASE_URL").ok(),
            api_key,
            model: std::env::var("ANTHROPIC_MODEL").ok(),
            small_fast_model: std::env::var("ANTHROPIC_SMALL_FAST_MODEL").ok(),
            max_thinking_tokens,
        }
    }

    /// Check if any configuration is set
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
            || self.api_key.is_some()
            || self.model.is_some()
            || self.small_fast_model.is_some()
            || self.max_thinking_tokens.is_some()
    }

    /// Environment variables to pass to the engine subprocess
    pub fn to_env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();

        if let Some(ref url) = self.base_url {
            env.insert("ANTHROPIC_BASE_URL".to_string(), url.clone());
        }
        if let Some(ref key) = self.api_key {
            env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }
        if let Some(ref model) = self.model {
            env.insert("ANTHROPIC_MODEL".to_string(), model.clone());
        }
        if let Some(ref model) = self.small_fast_model {
            env.insert("ANTHROPIC_SMALL_FAST_MODEL".to_string(), model.clone());
        }
        if let Some(tokens) = self.max_thinking_tokens {
            env.insert("MAX_THINKING_TOKENS".to_string(), tokens.to_string());
        }

        env
    }

    /// Apply configuration to engine options
    ///
    /// Explicit options already set (e.g. a model from the command line)
    /// are left untouched.
    pub fn apply_to_options(&self, options: &mut EngineOptions) {
        if !self.is_configured() {
            return;
        }
        if options.model.is_none() {
            options.model.clone_from(&self.model);
        }
        if options.fallback_model.is_none() {
            options.fallback_model.clone_from(&self.small_fast_model);
        }
        if options.max_thinking_tokens.is_none() {
            options.max_thinking_tokens = self.max_thinking_tokens;
        }
        for (key, value) in self.to_env_vars() {
            options.env.entry(key).or_insert(value);
        }
    }
}

/// Where session logs are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Process memory only; history does not survive a restart
    Memory,
    /// SQLite database file
    Sqlite(PathBuf),
}

impl StoreLocation {
    /// Parse `memory`, `sqlite://<path>` or a bare file path
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AgentError::config_error("store location is empty"));
        }
        if raw.eq_ignore_ascii_case("memory") || raw == "sqlite::memory:" {
            return Ok(Self::Memory);
        }
        let path = raw.strip_prefix("sqlite://").unwrap_or(raw);
        if path.is_empty() {
            return Err(AgentError::config_error(format!(
                "store location has no path: {raw}"
            )));
        }
        Ok(Self::Sqlite(PathBuf::from(path)))
    }

    /// Default location under the user's data directory
    pub fn default_sqlite() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self::Sqlite(base.join("claude-agent-gateway").join("sessions.db"))
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLocation::Memory => write!(f, "memory"),
            StoreLocation::Sqlite(path) => write!(f, "sqlite://{}", path.display()),
        }
    }
}

/// Per-session timing knobs used by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// How long an approval request waits before it is denied with "timeout"
    pub approval_timeout: Duration,
    /// Bounded time the engine gets to unwind after an interrupt
    pub interrupt_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
        }
    }
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the HTTP/websocket listener binds to
    pub listen: SocketAddr,
    /// Durable session log location
    pub store: StoreLocation,
    /// Sliding retention window for session logs
    pub retention: Duration,
    /// How long a detached session stays live waiting for a reconnect
    pub reconnect_grace: Duration,
    /// Outbound queue depth per connection
    pub send_queue: usize,
    /// Orchestrator timing
    pub orchestrator: OrchestratorSettings,
    /// Engine launch options
    pub engine: EngineOptions,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            store: StoreLocation::Memory,
            retention: DEFAULT_RETENTION,
            reconnect_grace: Duration::ZERO,
            send_queue: DEFAULT_SEND_QUEUE,
            orchestrator: OrchestratorSettings::default(),
            engine: EngineOptions::default(),
        }
    }
}
