//! Health endpoint.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::{AppState, ListenerStatus};

/// GET /health
///
/// Unauthenticated liveness and upstream status. "healthy" requires the
/// upstream listener to be connected; a reconnecting
/// or down listener reports "degraded" so operators see silent-feed windows
/// without log digging.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let listener = *state.listener_status.borrow();
    let counts = state.registry.counts().await;

    let status = match listener {
        ListenerStatus::Connected => "healthy",
        ListenerStatus::Reconnecting { .. } | ListenerStatus::Down => "degraded",
    };
    let listener_json = match listener {
        ListenerStatus::Reconnecting { attempt } => serde_json::json!({
            "state": listener.label(),
            "attempt": attempt,
        }),
        _ => serde_json::json!({ "state": listener.label() }),
    };

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "listener": listener_json,
        "connections": {
            "websocket": counts.websocket,
            "sse": counts.sse,
            "total": counts.total(),
        },
    }))
}
