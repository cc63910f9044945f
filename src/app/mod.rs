//! Gateway application
//!
//! This module wires the pieces together:
//! - `GatewayApp`: configuration, durable log and session registry
//! - The runner: logging, store maintenance, serving and shutdown

mod core;
mod runner;

pub use core::GatewayApp;
pub use runner::{run_gateway, run_gateway_with_cli, shutdown_otel};
