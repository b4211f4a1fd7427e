//! WebSocket connection lifecycle: one connection is one session.
//!
//! Inbound binary frames are caller PCM16 handed to the session pipeline.
//! Outbound traffic interleaves the session's JSON event stream (text
//! frames) with synthesized reply audio (binary frames).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use switchboard_core::events::SessionEvent;
use switchboard_core::session::TransportType;
use switchboard_orchestrator::OpenSession;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// Synthesized audio buffered between the session and the socket.
const AUDIO_OUT_CAPACITY: usize = 256;

/// How long to let the writer flush SessionClosed to a slow client.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Handle a new WebSocket connection for its whole lifetime.
pub async fn handle_ws_connection(
    state: Arc<AppState>,
    ws: WebSocket,
    requested_session: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (audio_out_tx, mut audio_out_rx) = mpsc::channel::<Vec<u8>>(AUDIO_OUT_CAPACITY);
    let opened = state
        .manager
        .open_session(requested_session, TransportType::Browser, audio_out_tx)
        .await;

    let open = match opened {
        Ok(open) => open,
        Err(e) => {
            warn!(error = %e, "Refusing WebSocket session");
            let frame = json!({ "type": "error", "message": e.to_string() });
            if let Ok(msg) = serde_json::to_string(&frame) {
                let _ = ws_tx.send(Message::Text(msg.into())).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let OpenSession {
        session_id,
        audio_in,
        mut events,
    } = open;
    info!(session = %session_id, "WebSocket session connected");
    #[cfg(feature = "metrics")]
    crate::metrics::record_session_open();

    // First frame tells the client which session it is speaking to, so a
    // reconnect can resume with ?session=<id>.
    let ready = json!({ "type": "session_ready", "session_id": session_id });
    if let Ok(msg) = serde_json::to_string(&ready) {
        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
            state.manager.close_session(&session_id).await;
            #[cfg(feature = "metrics")]
            crate::metrics::record_session_close();
            return;
        }
    }

    // Writer: session events as JSON text, synthesized audio as binary.
    // Exits after forwarding SessionClosed so the final event always
    // reaches the client before the Close frame.
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_event(&event);
                    let closing = matches!(event, SessionEvent::SessionClosed { .. });
                    match serde_json::to_string(&event) {
                        Ok(msg) => {
                            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Unserializable session event"),
                    }
                    if closing {
                        break;
                    }
                }
                chunk = audio_out_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    if ws_tx.send(Message::Binary(chunk.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Read loop: binary frames carry 20ms PCM16 from the caller.
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Binary(frame)) => {
                // Send fails once the pipeline is gone (swept or shut down).
                if audio_in.send(frame.to_vec()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Text(_)) => {
                debug!(session = %session_id, "Ignoring text frame from client");
            }
            Ok(Message::Ping(_)) => {
                // Axum answers pings itself.
            }
            Ok(Message::Close(_)) => {
                debug!(session = %session_id, "Client requested close");
                break;
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    state.manager.close_session(&session_id).await;
    // Let the writer drain SessionClosed and trailing audio, but never
    // block teardown on a client that stopped reading.
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    #[cfg(feature = "metrics")]
    crate::metrics::record_session_close();
    info!(session = %session_id, "WebSocket session closed");
}
