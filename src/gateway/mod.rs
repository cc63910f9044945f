//! Websocket connection gateway
//!
//! HTTP surface (`/ws`, `/health`, `/api/status`) and the per-connection
//! pump between a websocket and its session's orchestrator.

mod connection;
mod server;

pub use server::{GatewayState, build_router, serve};
