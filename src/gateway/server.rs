//! HTTP routes and listener

use std::future::Future;

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::connection;
use crate::session::SessionRegistry;

/// Shared state of every route
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub registry: SessionRegistry,
    /// Outbound queue depth per connection
    pub send_queue: usize,
    /// Cancelled when the process shuts down; ends every connection
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    session_id: Option<String>,
}

/// Build the gateway router
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: GatewayState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Gateway listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state, params.session_id))
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn status_handler(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.session_count(),
        "store_degraded": state.registry.log().is_degraded(),
        "store_backend": state.registry.log().backend(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
