//! WebSocket stream endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{resolve_token, StreamParams};
use crate::registry::Transport;
use crate::{ApiError, AppState};
use praxis_core::{defaults, StreamMessage, SubscriptionFilter};

/// GET /v1/ws?entities=a,b&project_id=X
///
/// Upgrade to a change stream.
///
/// Auth and filter validation run before the upgrade, so a bad token is an
/// HTTP 401 and a bad entity list an HTTP 400, never a socket that opens
/// and immediately dies.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let token = resolve_token(&headers, &params);
    state.auth.verify(token.as_deref()).await?;
    let filter = params.filter()?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, filter)))
}

/// Drive one accepted WebSocket connection to completion.
///
/// The outbound channel is seeded with the connected notice before the
/// connection is registered, which pins it as the first frame no matter how
/// fast the fan-out runs. Two tasks then pump the socket: one forwards
/// frames and pings on an interval, one consumes client traffic for
/// liveness. Either side ending tears the whole connection down.
async fn handle_socket(socket: WebSocket, state: AppState, filter: SubscriptionFilter) {
    use futures::{SinkExt, StreamExt};

    let connection_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<StreamMessage>(defaults::CONNECTION_BUFFER);
    let _ = tx.try_send(StreamMessage::connected(connection_id));
    state
        .registry
        .register(connection_id, Transport::WebSocket, filter, tx)
        .await;

    let (mut sender, mut receiver) = socket.split();

    // Forward frames to the client and ping on an interval.
    let send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(message) => match serde_json::to_string(&message) {
                            Ok(json) => {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    subsystem = "live",
                                    component = "ws",
                                    connection_id = %connection_id,
                                    error = %e,
                                    "Failed to encode stream frame"
                                );
                            }
                        },
                        // The registry dropped us (prune or shutdown):
                        // close the socket politely.
                        None => {
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Consume client frames. Nothing inbound is a command; pings and pongs
    // refresh the heartbeat, close ends the session.
    let registry = Arc::clone(&state.registry);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Pong(_) | Message::Ping(_) => registry.touch(connection_id).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Either task finishing means the connection is done.
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    state.registry.remove(connection_id).await;
    debug!(
        subsystem = "live",
        component = "ws",
        connection_id = %connection_id,
        "WebSocket session ended"
    );
}
