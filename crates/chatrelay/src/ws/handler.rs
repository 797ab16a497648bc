//! WebSocket handler for session connections.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code},
    },
    response::Response,
};
use bytes::Bytes;
use chatrelay_protocol::{ServerEvent, parse_command};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::api::{ApiResult, AppState, validate_session_id};
use crate::relay::RelayHandle;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// WebSocket upgrade handler.
///
/// GET /api/sessions/{session_id}/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    validate_session_id(&session_id)?;

    let relay = state.hub.relay(&session_id);
    let conn_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    info!(
        "WebSocket upgrade for session {} (connection {})",
        session_id, conn_id
    );

    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, relay, conn_id)))
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            None
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_ws_connection(mut socket: WebSocket, relay: RelayHandle, conn_id: String) {
    let session_id = relay.session_id().to_string();

    let attachment = match relay.attach().await {
        Ok(attachment) => attachment,
        Err(e) => {
            error!(
                "Failed to attach connection {} to session {}: {:#}",
                conn_id, session_id, e
            );
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    let ready = ServerEvent::Ready {
        state: attachment.snapshot,
    };
    let Some(ready) = encode(&ready) else {
        return;
    };
    if let Err(e) = sender.send(ready).await {
        warn!("Failed to send ready to connection {}: {}", conn_id, e);
        return;
    }
    debug!("Connection {} ready on session {}", conn_id, session_id);

    let mut events = attachment.events;
    let conn_id_send = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        // The first tick completes immediately.
        ping_interval.tick().await;

        loop {
            tokio::select! {
                result = events.recv() => match result {
                    Ok(event) => {
                        let Some(message) = encode(&event) else {
                            continue;
                        };
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Reconnecting yields a fresh snapshot.
                        warn!(
                            "Connection {} lagged behind by {} events, closing",
                            conn_id_send, skipped
                        );
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::AGAIN,
                                reason: Utf8Bytes::from_static("event stream lagged, reconnect"),
                            })))
                            .await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let receive = async {
        while let Some(msg_result) = receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match parse_command(text.as_str()) {
                    Some(command) => {
                        if let Err(e) = relay.send(command).await {
                            warn!("Dropping connection {}: {:#}", conn_id, e);
                            break;
                        }
                    }
                    None => {
                        debug!("Ignoring unrecognized frame from connection {}", conn_id);
                    }
                },
                Ok(Message::Binary(_)) => {
                    debug!("Received binary message from connection {}, ignoring", conn_id);
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => {
                    info!("Connection {} closed by client", conn_id);
                    break;
                }
                Err(e) => {
                    warn!("WebSocket error on connection {}: {}", conn_id, e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = &mut send_task => {}
        _ = receive => {}
    }

    send_task.abort();
    info!(
        "WebSocket connection {} closed for session {}",
        conn_id, session_id
    );
}
