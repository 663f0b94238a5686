//! HTTP handlers for the stream endpoints.
//!
//! WebSocket and SSE share the handshake: resolve the token (header first,
//! query fallback for clients that cannot set headers), run the auth gate,
//! build the subscription filter from query params. Rejections happen as
//! plain HTTP before any upgrade so clients see an explicit 401/400 instead
//! of a hang.

pub mod health;
pub mod sse;
pub mod ws;

use axum::http::{header, HeaderMap};
use serde::Deserialize;

use crate::ApiError;
use praxis_core::{Entity, SubscriptionFilter};

/// Query parameters accepted by both stream endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Comma-separated entity tags; absent or empty means all entities.
    pub entities: Option<String>,
    /// Project scope for the subscription filter.
    pub project_id: Option<String>,
    /// Token fallback for browser EventSource/WebSocket clients.
    pub token: Option<String>,
}

impl StreamParams {
    /// Build the subscription filter, rejecting unknown entity tags.
    pub fn filter(&self) -> Result<SubscriptionFilter, ApiError> {
        let mut entities = Vec::new();
        if let Some(csv) = &self.entities {
            for tag in csv.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let entity = Entity::from_tag(tag)
                    .ok_or_else(|| ApiError::BadRequest(format!("unknown entity: {tag:?}")))?;
                if !entities.contains(&entity) {
                    entities.push(entity);
                }
            }
        }
        let mut filter = SubscriptionFilter::for_entities(entities);
        if let Some(project_id) = &self.project_id {
            filter = filter.scoped(project_id.clone());
        }
        Ok(filter)
    }
}

/// Resolve the presented token: `Authorization: Bearer` wins over `?token=`.
pub fn resolve_token(headers: &HeaderMap, params: &StreamParams) -> Option<String> {
    crate::auth::bearer_token(headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()))
        .map(str::to_string)
        .or_else(|| params.token.clone())
}
