//! Live change broadcast server.
//!
//! Bridges committed database mutations to connected clients: a single
//! LISTEN connection ([`listener`]) consumes the change channel, normalized
//! events flow over the in-process bus, and the fan-out ([`registry`])
//! delivers each one to every WebSocket and SSE connection whose
//! subscription filter matches. The delivery contract is at-most-once,
//! FIFO per upstream source; clients reconcile missed windows by re-fetching
//! through the regular API.
//!
//! Built as a library plus a thin binary so integration tests can mount the
//! real router in-process on an ephemeral port.

pub mod auth;
pub mod handlers;
pub mod listener;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use praxis_core::defaults;

pub use auth::{AuthVerifier, StaticTokenVerifier};
pub use listener::{ChangeListener, ListenerConfig, ListenerHandle, ListenerStatus};
pub use registry::{
    spawn_fanout, spawn_heartbeat, ConnectionCounts, ConnectionGuard, ConnectionRegistry,
    Transport,
};

/// Shared state behind the stream endpoints.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub auth: Arc<dyn AuthVerifier>,
    pub listener_status: watch::Receiver<ListenerStatus>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        auth: Arc<dyn AuthVerifier>,
        listener_status: watch::Receiver<ListenerStatus>,
    ) -> Self {
        Self {
            registry,
            auth,
            listener_status,
            started_at: Instant::now(),
        }
    }
}

/// HTTP-facing error envelope: `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Internal(praxis_core::Error),
}

impl From<praxis_core::Error> for ApiError {
    fn from(err: praxis_core::Error) -> Self {
        match err {
            praxis_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            praxis_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Build the router over the given state.
///
/// `/health` is unauthenticated; the stream endpoints run the auth gate
/// before any upgrade. CORS is wide open without credentials: the feed
/// carries no per-user data and browser SSE clients need it.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/v1/ws", get(handlers::ws::ws_handler))
        .route("/v1/events", get(handlers::sse::sse_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
                .max_age(Duration::from_secs(defaults::CORS_MAX_AGE_SECS)),
        )
        .with_state(state)
}
