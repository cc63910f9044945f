//! Per-connection event pump
//!
//! The socket is split: a writer task drains the session's outbound queue
//! into the socket (and pings every 30 s), while the receive loop decodes
//! frames and hands them to the orchestrator. Whichever side ends first
//! ends the connection; the session itself outlives it.

use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::server::GatewayState;
use crate::protocol::{ServerEvent, decode_client, encode_server};
use crate::session::Orchestrator;

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    requested: Option<String>,
) {
    let start_time = Instant::now();
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(state.send_queue.max(1));
    let mut writer = tokio::spawn(write_loop(sink, rx));

    let Some((orchestrator, binding)) = state.registry.connect(requested.as_deref(), tx).await
    else {
        // The queue's sender is gone, so the writer closes the socket
        tracing::warn!(requested_session_id = ?requested, "Could not bind a session, closing");
        drop(writer.await);
        return;
    };
    let session_id = orchestrator.session_id();

    tracing::info!(
        session_id = %session_id,
        requested_session_id = ?requested,
        binding,
        "WebSocket connected"
    );

    tokio::select! {
        () = read_loop(stream, &orchestrator) => {}
        _ = &mut writer => {}
        () = state.shutdown.cancelled() => {}
    }

    writer.abort();
    state.registry.release(&orchestrator, binding).await;

    tracing::info!(
        session_id = %orchestrator.session_id(),
        binding,
        elapsed_ms = start_time.elapsed().as_millis(),
        "WebSocket disconnected"
    );
}

async fn read_loop(mut stream: SplitStream<WebSocket>, orchestrator: &Orchestrator) {
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket read failed");
                break;
            }
        };

        match message {
            Message::Text(text) => match decode_client(text.as_str()) {
                Ok(event) => {
                    tracing::debug!(
                        session_id = %orchestrator.session_id(),
                        event_type = event.kind(),
                        "Inbound event"
                    );
                    orchestrator.handle_event(event).await;
                }
                Err(e) => tracing::warn!(
                    session_id = %orchestrator.session_id(),
                    error = %e,
                    "Dropping malformed frame"
                ),
            },
            Message::Binary(data) => tracing::warn!(
                session_id = %orchestrator.session_id(),
                len = data.len(),
                "Dropping binary frame"
            ),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<ServerEvent>) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                let text = match encode_server(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(event_type = event.kind(), error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    return;
                }
            }
        }
    }

    // Outbound queue closed: the session dropped this connection
    drop(sink.send(Message::Close(None)).await);
}
