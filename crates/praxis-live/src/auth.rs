//! Stream handshake authentication.
//!
//! The only thing gated here is the handshake itself: once a connection is
//! accepted it receives events until it closes. Verification is behind a
//! trait so deployments can plug in something richer than the default
//! shared-secret check.

use async_trait::async_trait;
use tracing::warn;

use praxis_core::{Error, Result};

/// Pluggable gate for the stream handshake.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// Check a presented token; `None` means the request carried none.
    /// Rejection reasons surface as HTTP 401 before any upgrade.
    async fn verify(&self, token: Option<&str>) -> Result<()>;
}

/// Shared-secret verifier backed by a single static token.
///
/// With no token configured every handshake is accepted. That is the
/// development mode; it is announced loudly at startup so it cannot pass
/// unnoticed in production logs.
pub struct StaticTokenVerifier {
    token: Option<String>,
}

impl StaticTokenVerifier {
    /// Require the given token on every handshake.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Accept every handshake.
    pub fn open() -> Self {
        Self { token: None }
    }

    /// Build from `PRAXIS_API_TOKEN`. Unset or empty means open access.
    pub fn from_env() -> Self {
        match std::env::var("PRAXIS_API_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Self::new(token.trim().to_string()),
            _ => {
                warn!(
                    subsystem = "live",
                    component = "auth",
                    "PRAXIS_API_TOKEN not set; stream endpoints are open"
                );
                Self::open()
            }
        }
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: Option<&str>) -> Result<()> {
        match (&self.token, token) {
            (None, _) => Ok(()),
            (Some(expected), Some(presented)) if expected == presented => Ok(()),
            (Some(_), Some(_)) => Err(Error::Unauthorized("invalid token".to_string())),
            (Some(_), None) => Err(Error::Unauthorized("missing bearer token".to_string())),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    match header {
        Some(value) if value.starts_with("Bearer ") => {
            let token = value.trim_start_matches("Bearer ").trim();
            (!token.is_empty()).then_some(token)
        }
        _ => None,
    }
}
