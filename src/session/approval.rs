//! Approval gate primitives
//!
//! A [`PendingApproval`] pairs the tool call awaiting the operator with the
//! sending half of a oneshot channel; the turn task waits on the receiving
//! half. Resolution consumes the sender, so only the first resolution
//! (operator, interrupt or timeout) is ever delivered.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::engine::PermissionDecision;
use crate::protocol::ApprovalResponse;

const DEFAULT_DENY_MESSAGE: &str = "User denied the request";
const INTERRUPTED_MESSAGE: &str = "Interrupted by user";
const TIMEOUT_MESSAGE: &str = "Approval timeout - user did not respond";

/// Who resolved an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOrigin {
    /// The operator's `approval_response`
    Operator,
    /// An interrupt, redirect, clear or shutdown
    Interrupt,
    /// Nobody answered within the approval timeout
    Timeout,
}

/// Outcome of an approval request
///
/// The origin, not the reason text, tells the gateway's own denials apart
/// from the operator's, so any reason the operator types is passed through
/// as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub origin: DecisionOrigin,
    pub approved: bool,
    pub deny_reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approved() -> Self {
        Self {
            origin: DecisionOrigin::Operator,
            approved: true,
            deny_reason: None,
        }
    }

    /// Operator denial with the reason shown to the model
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            origin: DecisionOrigin::Operator,
            approved: false,
            deny_reason: Some(reason.into()),
        }
    }

    pub fn interrupted() -> Self {
        Self {
            origin: DecisionOrigin::Interrupt,
            approved: false,
            deny_reason: None,
        }
    }

    pub fn timeout() -> Self {
        Self {
            origin: DecisionOrigin::Timeout,
            approved: false,
            deny_reason: None,
        }
    }

    /// Decision carried by an operator's `approval_response`
    pub fn from_response(response: &ApprovalResponse) -> Self {
        if response.approved {
            return Self::approved();
        }
        let reason = response
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_DENY_MESSAGE);
        Self::denied(reason)
    }

    pub fn is_timeout(&self) -> bool {
        self.origin == DecisionOrigin::Timeout
    }

    /// Answer for the engine; the deny message is shown to the model
    pub fn to_permission(&self) -> PermissionDecision {
        if self.approved {
            return PermissionDecision::Allow;
        }
        let message = match self.origin {
            DecisionOrigin::Interrupt => INTERRUPTED_MESSAGE,
            DecisionOrigin::Timeout => TIMEOUT_MESSAGE,
            DecisionOrigin::Operator => self.deny_reason.as_deref().unwrap_or(DEFAULT_DENY_MESSAGE),
        };
        PermissionDecision::Deny {
            message: message.to_string(),
        }
    }
}

/// A tool call waiting for the operator
#[derive(Debug)]
pub struct PendingApproval {
    pub id: u64,
    pub tool_name: String,
    pub tool_input: Value,
    responder: Option<oneshot::Sender<ApprovalDecision>>,
}

impl PendingApproval {
    /// Create the pending approval and the receiver the turn task waits on
    pub fn new(
        id: u64,
        tool_name: impl Into<String>,
        tool_input: Value,
    ) -> (Self, oneshot::Receiver<ApprovalDecision>) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            id,
            tool_name: tool_name.into(),
            tool_input,
            responder: Some(tx),
        };
        (pending, rx)
    }

    /// Deliver the decision; false if it was already resolved
    pub fn resolve(&mut self, decision: ApprovalDecision) -> bool {
        match self.responder.take() {
            Some(tx) => {
                // The waiter may have gone away (turn cancelled); that is fine.
                drop(tx.send(decision));
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.responder.is_none()
    }
}
