//! Shared-secret authentication for the shape API
//!
//! When a secret is configured, shape requests must carry it in the
//! `secret` query parameter (or the legacy `api_secret`). Comparison is
//! constant-time.

use axum::extract::{Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Secret expected by [`secret_auth_middleware`]
#[derive(Clone)]
pub struct SecretAuth {
    secret: Arc<String>,
}

impl SecretAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::new(secret.into()),
        }
    }

    /// Constant-time comparison against the configured secret
    pub fn verify(&self, provided: &str) -> bool {
        let expected = self.secret.as_bytes();
        let provided = provided.as_bytes();
        expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
    }
}

impl std::fmt::Debug for SecretAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretAuth").field("secret", &"***").finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SecretParams {
    secret: Option<String>,
    api_secret: Option<String>,
}

/// Reject shape requests that do not present the secret. CORS preflight
/// requests pass through.
pub async fn secret_auth_middleware(
    State(auth): State<SecretAuth>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let params = Query::<SecretParams>::try_from_uri(request.uri())
        .map(|Query(p)| p)
        .unwrap_or_default();
    let provided = params.secret.or(params.api_secret);

    match provided {
        Some(secret) if auth.verify(&secret) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "Rejected request without a valid secret");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}
