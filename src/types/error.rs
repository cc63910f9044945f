//! Error types for the agent gateway

use claude_code_agent_sdk::ClaudeError;
use thiserror::Error;

use crate::store::StoreError;

/// Gateway error codes
///
/// Stable numeric codes so that log consumers can group failures without
/// parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Parse error: invalid JSON
    ParseError = -32700,
    /// Frame was valid JSON but not a known event
    InvalidFrame = -32600,
    /// Internal error
    InternalError = -32603,

    /// Not connected to the engine
    NotConnected = -32003,
    /// Operation cancelled
    Cancelled = -32006,
    /// Connection to the engine failed
    ConnectionFailed = -32007,
    /// Streaming error
    StreamingError = -32008,
    /// Engine sent something that violates the stream protocol
    EngineProtocol = -32009,
    /// Configuration error
    ConfigError = -32010,
    /// Durable store failure
    StoreError = -32011,
}

impl ErrorCode {
    /// Get the error code value
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum AgentError {
    // === Engine connection errors ===
    /// Engine client not connected
    #[error("Client not connected")]
    NotConnected,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {0}ms")]
    ConnectionTimeout(u64),

    // === Streaming errors ===
    /// Streaming error
    #[error("Streaming error: {0}")]
    StreamingError(String),

    // === Transport errors ===
    /// Client frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // === Configuration errors ===
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // === External errors ===
    /// Agent SDK error
    #[error("Claude SDK error: {0}")]
    ClaudeSdk(#[from] ClaudeError),

    /// Durable store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic errors ===
    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for the gateway
pub type Result<T> = std::result::Result<T, AgentError>;

/// Group SDK failures: the engine could not be reached, it spoke garbage,
/// or the stream broke
fn sdk_error_code(error: &ClaudeError) -> ErrorCode {
    match error {
        ClaudeError::Connection(_)
        | ClaudeError::Process(_)
        | ClaudeError::CliNotFound(_)
        | ClaudeError::Timeout(_)
        | ClaudeError::InvalidConfig(_) => ErrorCode::ConnectionFailed,
        ClaudeError::JsonDecode(_)
        | ClaudeError::MessageParse(_)
        | ClaudeError::ControlProtocol(_) => ErrorCode::EngineProtocol,
        _ => ErrorCode::StreamingError,
    }
}

impl AgentError {
    /// Get the error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AgentError::NotConnected => ErrorCode::NotConnected,
            AgentError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            AgentError::ConnectionTimeout(_) => ErrorCode::ConnectionFailed,
            AgentError::StreamingError(_) => ErrorCode::StreamingError,
            AgentError::InvalidFrame(_) => ErrorCode::InvalidFrame,
            AgentError::ConfigError(_) => ErrorCode::ConfigError,
            AgentError::ClaudeSdk(e) => sdk_error_code(e),
            AgentError::Store(_) => ErrorCode::StoreError,
            AgentError::Io(_) => ErrorCode::InternalError,
            AgentError::Json(_) => ErrorCode::ParseError,
            AgentError::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Check if this error is retryable
    ///
    /// Engine faults are recoverable: the next user message reconnects.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::NotConnected
                | AgentError::ConnectionFailed(_)
                | AgentError::ConnectionTimeout(_)
                | AgentError::StreamingError(_)
                | AgentError::ClaudeSdk(_)
                | AgentError::Store(_)
        )
    }

    /// Check if this error is a client error (caused by invalid input)
    pub fn is_client_error(&self) -> bool {
        matches!(self, AgentError::InvalidFrame(_))
    }

    // === Constructor helpers ===

    /// Create a connection failed error
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        AgentError::ConnectionFailed(msg.into())
    }

    /// Create a streaming error
    pub fn streaming_error(msg: impl Into<String>) -> Self {
        AgentError::StreamingError(msg.into())
    }

    /// Create an invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        AgentError::InvalidFrame(msg.into())
    }

    /// Create a configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        AgentError::ConfigError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::connection_failed("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");

        let err = AgentError::ConnectionTimeout(1500);
        assert_eq!(err.to_string(), "Connection timeout after 1500ms");

        let err: AgentError = ClaudeError::Transport("pipe closed".to_string()).into();
        assert_eq!(err.to_string(), "Claude SDK error: Transport error: pipe closed");
    }

    #[test]
    fn test_error_codes() {
        let err = AgentError::NotConnected;
        assert_eq!(err.error_code(), ErrorCode::NotConnected);
        assert_eq!(err.error_code().code(), -32003);

        let err = AgentError::Store(StoreError::Unavailable("down".to_string()));
        assert_eq!(err.error_code(), ErrorCode::StoreError);
        assert_eq!(err.error_code().code(), -32011);

        let err = AgentError::Cancelled;
        assert_eq!(err.error_code(), ErrorCode::Cancelled);
    }

    #[test]
    fn test_sdk_error_codes() {
        let err: AgentError = ClaudeError::Timeout("initialize".to_string()).into();
        assert_eq!(err.error_code(), ErrorCode::ConnectionFailed);

        let err: AgentError = ClaudeError::ControlProtocol("bad response".to_string()).into();
        assert_eq!(err.error_code(), ErrorCode::EngineProtocol);
        assert_eq!(err.error_code().code(), -32009);

        let err: AgentError = ClaudeError::Transport("eof".to_string()).into();
        assert_eq!(err.error_code(), ErrorCode::StreamingError);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_retryable() {
        assert!(AgentError::connection_failed("refused").is_retryable());
        assert!(AgentError::streaming_error("lost").is_retryable());
        assert!(AgentError::ConnectionTimeout(10).is_retryable());
        assert!(!AgentError::invalid_frame("bad").is_retryable());
        assert!(!AgentError::Cancelled.is_retryable());
    }

    #[test]
    fn test_is_client_error() {
        assert!(AgentError::invalid_frame("bad").is_client_error());
        assert!(!AgentError::NotConnected.is_client_error());
        assert!(!AgentError::config_error("empty").is_client_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: AgentError = json_err.into();
        assert!(matches!(err, AgentError::Json(_)));
        assert_eq!(err.error_code(), ErrorCode::ParseError);
    }
}
