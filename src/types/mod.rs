//! Shared types for the agent gateway
//!
//! Errors and configuration used across the crate.

mod config;
mod error;

pub use config::{
    AgentConfig, DEFAULT_APPROVAL_TIMEOUT, DEFAULT_INTERRUPT_GRACE, DEFAULT_RETENTION,
    DEFAULT_SEND_QUEUE, GatewayConfig, OrchestratorSettings, StoreLocation,
};
pub use error::{AgentError, ErrorCode, Result};
