//! Session orchestration
//!
//! This module handles:
//! - The per-session state machine driving one engine client
//! - The approval gate suspending gated tool calls
//! - The registry mapping session identifiers to live orchestrators

mod approval;
mod orchestrator;
mod registry;
mod state;

pub use approval::{ApprovalDecision, DecisionOrigin, PendingApproval};
pub use orchestrator::{Orchestrator, SessionDeps, new_session_id};
pub use registry::{SessionMap, SessionRegistry};
pub use state::AgentSessionState;
