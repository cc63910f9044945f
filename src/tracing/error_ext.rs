//! Error tracing extensions
//!
//! Engine faults never propagate past their session; they are logged here
//! with enough context to group them, then surfaced to the operator as an
//! `error` event.

use std::error::Error as StdError;

use crate::types::AgentError;

/// Extension trait for logging an error with its full context
pub trait ErrorTraceExt {
    /// Log with error code, retryable status and source chain
    fn trace_error(&self) -> &Self;

    /// Same as [`trace_error`](Self::trace_error), tagged with the session
    /// and the operation that failed
    fn trace_session_error(&self, session_id: &str, operation: &'static str) -> &Self;
}

impl ErrorTraceExt for AgentError {
    fn trace_error(&self) -> &Self {
        let error_code = self.error_code();
        let error_chain = source_chain(self);

        tracing::error!(
            error = %self,
            error_code = error_code.code(),
            error_code_name = ?error_code,
            is_retryable = self.is_retryable(),
            is_client_error = self.is_client_error(),
            error_chain = ?error_chain,
            "Error occurred with full context"
        );

        self
    }

    fn trace_session_error(&self, session_id: &str, operation: &'static str) -> &Self {
        let error_code = self.error_code();
        let error_chain = source_chain(self);

        tracing::error!(
            session_id = %session_id,
            operation,
            error = %self,
            error_code = error_code.code(),
            error_code_name = ?error_code,
            is_retryable = self.is_retryable(),
            error_chain = ?error_chain,
            "Session operation failed"
        );

        self
    }
}

fn source_chain(error: &dyn StdError) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = error.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_source_chain() {
        let error = AgentError::Store(StoreError::Io("pipe closed".to_string()));
        let chain = source_chain(&error);
        assert_eq!(chain.len(), 1);
        assert!(chain[0].contains("pipe closed"));

        assert!(source_chain(&AgentError::Cancelled).is_empty());
    }

    #[test]
    fn test_trace_returns_self() {
        let error = AgentError::streaming_error("engine went away");
        let traced = error
            .trace_error()
            .trace_session_error("session-1", "turn");
        assert!(matches!(traced, AgentError::StreamingError(_)));
    }
}
