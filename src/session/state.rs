//! Session state as seen by the operator

use std::fmt;

use crate::protocol::StatusKind;

/// Orchestrator state
///
/// `idle` is both the initial state and the state every turn returns to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AgentSessionState {
    #[default]
    Idle,
    Thinking,
    AwaitingApproval,
    Interrupted,
    Error,
}

impl AgentSessionState {
    /// Whether a turn is running (or still unwinding)
    pub fn is_busy(self) -> bool {
        !matches!(self, AgentSessionState::Idle)
    }

    /// Status value announced when entering this state, if any
    pub fn status(self) -> Option<StatusKind> {
        match self {
            AgentSessionState::Idle => None,
            AgentSessionState::Thinking => Some(StatusKind::Thinking),
            AgentSessionState::AwaitingApproval => Some(StatusKind::AwaitingApproval),
            AgentSessionState::Interrupted => Some(StatusKind::Interrupted),
            AgentSessionState::Error => Some(StatusKind::Error),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentSessionState::Idle => "idle",
            AgentSessionState::Thinking => "thinking",
            AgentSessionState::AwaitingApproval => "awaiting_approval",
            AgentSessionState::Interrupted => "interrupted",
            AgentSessionState::Error => "error",
        }
    }
}

impl fmt::Display for AgentSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_status_mapping() {
        assert_eq!(AgentSessionState::default(), AgentSessionState::Idle);
        assert!(!AgentSessionState::Idle.is_busy());
        assert!(AgentSessionState::Interrupted.is_busy());
        assert_eq!(AgentSessionState::Idle.status(), None);
        assert_eq!(
            AgentSessionState::AwaitingApproval.status(),
            Some(StatusKind::AwaitingApproval)
        );
        assert_eq!(AgentSessionState::AwaitingApproval.to_string(), "awaiting_approval");
    }
}
