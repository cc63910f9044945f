//! Command-line interface definitions
//!
//! Provides CLI argument parsing using clap for the Claude agent gateway.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::engine::{DEFAULT_AUTO_ALLOWED_TOOLS, EngineOptions};
use crate::types::{
    DEFAULT_SEND_QUEUE, GatewayConfig, OrchestratorSettings, Result, StoreLocation,
};

/// Claude agent gateway - drive Claude Code over a websocket with a
/// human-in-the-loop approval gate
#[derive(Parser, Debug, Clone)]
#[command(name = "claude-agent-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Address to bind the HTTP/websocket listener to
    #[arg(long, value_name = "ADDR", env = "GATEWAY_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "GATEWAY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Session log store: `memory`, `sqlite://<path>` or a file path
    /// (default: sqlite database under the user's data directory)
    #[arg(long, value_name = "LOCATION", env = "GATEWAY_STORE")]
    pub store: Option<String>,

    /// Sliding retention window of a session log, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 21_600)]
    pub retention_secs: u64,

    /// How long an approval request waits for the operator, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub approval_timeout_secs: u64,

    /// Time the engine gets to stop after an interrupt, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub interrupt_grace_ms: u64,

    /// How long a disconnected session stays live waiting for a reconnect
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub reconnect_grace_secs: u64,

    /// Path to the claude executable (looked up on PATH when unset)
    #[arg(long, value_name = "PATH", env = "CLAUDE_CODE_PATH")]
    pub claude_path: Option<PathBuf>,

    /// Working directory of the engine
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Replace the engine's system prompt
    #[arg(long, value_name = "PROMPT")]
    pub system_prompt: Option<String>,

    /// Append to the engine's system prompt
    #[arg(long, value_name = "PROMPT")]
    pub append_system_prompt: Option<String>,

    /// Tool that runs without approval (repeatable; replaces the default
    /// read-only set)
    #[arg(long = "allowed-tool", value_name = "TOOL")]
    pub allowed_tools: Vec<String>,

    /// Tool the engine may never use (repeatable)
    #[arg(long = "disallowed-tool", value_name = "TOOL")]
    pub disallowed_tools: Vec<String>,

    /// Enable diagnostic mode (auto-log to temp file)
    #[arg(short, long)]
    pub diagnostic: bool,

    /// Log directory (implies diagnostic mode)
    #[arg(short = 'l', long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log file name (implies diagnostic mode)
    #[arg(short = 'f', long, value_name = "FILE")]
    pub log_file: Option<String>,

    /// Increase logging verbosity (-v, -vv)
    /// Note: RUST_LOG env var takes priority over this flag
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only errors)
    /// Note: RUST_LOG env var takes priority over this flag
    #[arg(short, long)]
    pub quiet: bool,

    /// OpenTelemetry OTLP endpoint (e.g., http://localhost:4317)
    /// When otel feature is enabled, this configures the OTLP exporter.
    /// When otel feature is disabled, this argument is accepted but ignored.
    #[arg(long, value_name = "URL", env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,

    /// OpenTelemetry service name
    #[arg(long, value_name = "NAME", default_value = "claude-agent-gateway")]
    pub otel_service_name: String,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 8000,
            store: None,
            retention_secs: 21_600,
            approval_timeout_secs: 300,
            interrupt_grace_ms: 5000,
            reconnect_grace_secs: 0,
            claude_path: None,
            cwd: None,
            system_prompt: None,
            append_system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            diagnostic: false,
            log_dir: None,
            log_file: None,
            verbose: 0,
            quiet: false,
            otel_endpoint: None,
            otel_service_name: "claude-agent-gateway".to_string(),
        }
    }
}

impl Cli {
    /// Check if diagnostic mode is enabled (output to file)
    ///
    /// Returns true if `--diagnostic` is set, or if `--log-dir` or `--log-file` is specified.
    pub fn is_diagnostic(&self) -> bool {
        self.diagnostic || self.log_dir.is_some() || self.log_file.is_some()
    }

    /// Check if OpenTelemetry tracing is enabled
    ///
    /// Returns true if `--otel-endpoint` is specified and the otel feature is enabled.
    #[cfg(feature = "otel")]
    pub fn is_otel_enabled(&self) -> bool {
        self.otel_endpoint.is_some()
    }

    /// Check if OpenTelemetry tracing is enabled (always false without otel feature)
    /// Note: --otel-endpoint argument is still accepted but ignored when feature is disabled
    #[cfg(not(feature = "otel"))]
    pub fn is_otel_enabled(&self) -> bool {
        if self.otel_endpoint.is_some() {
            tracing::warn!("--otel-endpoint specified but otel feature is not enabled, ignoring");
        }
        false
    }

    /// Get the log level based on CLI arguments
    ///
    /// - `--quiet`: ERROR
    /// - default: INFO
    /// - `-v`: DEBUG
    /// - `-vv` or more: TRACE
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }

    /// Get the log file path for diagnostic mode
    ///
    /// Uses the specified log directory and file name, or defaults to:
    /// - Directory: system temp directory
    /// - File: `claude-agent-gateway-{timestamp}.log`
    pub fn log_path(&self) -> PathBuf {
        let dir = self.log_dir.clone().unwrap_or_else(std::env::temp_dir);

        let filename = self.log_file.clone().unwrap_or_else(|| {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            format!("claude-agent-gateway-{timestamp}.log")
        });

        dir.join(filename)
    }

    /// Resolve the store location, defaulting to the user's data directory
    pub fn store_location(&self) -> Result<StoreLocation> {
        match &self.store {
            Some(raw) => StoreLocation::parse(raw),
            None => Ok(StoreLocation::default_sqlite()),
        }
    }

    /// Engine launch options from the command line
    pub fn engine_options(&self) -> EngineOptions {
        let allowed_tools = if self.allowed_tools.is_empty() {
            DEFAULT_AUTO_ALLOWED_TOOLS
                .iter()
                .map(|t| (*t).to_string())
                .collect()
        } else {
            self.allowed_tools.clone()
        };

        EngineOptions {
            program: self.claude_path.clone(),
            cwd: self.cwd.clone(),
            system_prompt: self.system_prompt.clone(),
            append_system_prompt: self.append_system_prompt.clone(),
            allowed_tools,
            disallowed_tools: self.disallowed_tools.clone(),
            ..EngineOptions::default()
        }
    }

    /// Build the server configuration
    pub fn to_config(&self) -> Result<GatewayConfig> {
        Ok(GatewayConfig {
            listen: SocketAddr::new(self.bind, self.port),
            store: self.store_location()?,
            retention: Duration::from_secs(self.retention_secs),
            reconnect_grace: Duration::from_secs(self.reconnect_grace_secs),
            send_queue: DEFAULT_SEND_QUEUE,
            orchestrator: OrchestratorSettings {
                approval_timeout: Duration::from_secs(self.approval_timeout_secs),
                interrupt_grace: Duration::from_millis(self.interrupt_grace_ms),
            },
            engine: self.engine_options(),
        })
    }
}
