//! Server-Sent Events stream endpoint.
//!
//! Same registry, same filter semantics as the WebSocket endpoint; the only
//! transport differences are spelled out by the protocol itself. SSE has no
//! pong, so liveness is keep-alive comments outward and socket teardown
//! inward; the registry's heartbeat prune skips SSE connections entirely.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{resolve_token, StreamParams};
use crate::registry::{ConnectionGuard, Transport};
use crate::{ApiError, AppState};
use praxis_core::{defaults, StreamMessage};

/// GET /v1/events?entities=a,b&project_id=X
///
/// The change stream over SSE.
pub async fn sse_handler(
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let token = resolve_token(&headers, &params);
    state.auth.verify(token.as_deref()).await?;
    let filter = params.filter()?;

    let connection_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel::<StreamMessage>(defaults::CONNECTION_BUFFER);
    let _ = tx.try_send(StreamMessage::connected(connection_id));
    state
        .registry
        .register(connection_id, Transport::Sse, filter, tx)
        .await;

    // Deregistration rides on stream drop: axum drops the stream when the
    // client goes away, the guard's Drop removes the registry entry.
    let guard = ConnectionGuard::new(Arc::clone(&state.registry), connection_id);

    use tokio_stream::StreamExt as _;
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).filter_map(move |message| {
        let _ = &guard;
        match serde_json::to_string(&message) {
            Ok(json) => Some(Ok(Event::default().event(message.kind()).data(json))),
            Err(_) => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(defaults::SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    ))
}
