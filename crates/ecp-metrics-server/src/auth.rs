//! Bearer token authentication for `/metrics`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

// ============================================================
// Bearer token
// ============================================================

/// Expected bearer token, kept only as a SHA-256 digest.
///
/// Comparing fixed-size digests keeps the comparison time independent of
/// both the length of the presented token and how much of it matches.
pub(crate) struct BearerToken {
    digest: sha2::digest::Output<Sha256>,
}

impl BearerToken {
    pub(crate) fn new(token: &str) -> Self {
        Self {
            digest: Sha256::digest(token.as_bytes()),
        }
    }

    pub(crate) fn matches(&self, presented: &str) -> bool {
        let presented = Sha256::digest(presented.as_bytes());
        self.digest.as_slice().ct_eq(presented.as_slice()).into()
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AuthError {
    #[error("Unauthorized: Missing or invalid Authorization header")]
    MissingCredential,
    #[error("Unauthorized: Invalid token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (challenge, outcome) = match self {
            AuthError::MissingCredential => {
                (r#"Bearer realm="Restricted""#, AuthOutcome::MissingCredential)
            }
            AuthError::InvalidToken => (
                r#"Bearer realm="Restricted", error="invalid_token""#,
                AuthOutcome::InvalidToken,
            ),
        };
        let mut response = (StatusCode::UNAUTHORIZED, format!("{self}\n")).into_response();
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        response.extensions_mut().insert(outcome);
        response
    }
}

/// Response extension recording how the request was authenticated, picked
/// up by the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthOutcome {
    Accepted,
    MissingCredential,
    InvalidToken,
}

impl AuthOutcome {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AuthOutcome::Accepted => "accepted",
            AuthOutcome::MissingCredential => "missing_credential",
            AuthOutcome::InvalidToken => "invalid_token",
        }
    }
}

/// Extracts the credential of an `Authorization: Bearer <token>` header.
fn bearer_credential(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// ============================================================
// Bearer auth middleware
// ============================================================

pub(crate) async fn bearer_auth_middleware(
    State(token): State<Arc<BearerToken>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();

    let Some(presented) = bearer_credential(&req) else {
        warn!(path = %path, "auth failed: missing or malformed authorization header");
        return AuthError::MissingCredential.into_response();
    };

    if !token.matches(presented) {
        warn!(path = %path, "auth failed: invalid token");
        return AuthError::InvalidToken.into_response();
    }

    debug!(path = %path, "authenticated");
    let mut response = next.run(req).await;
    response.extensions_mut().insert(AuthOutcome::Accepted);
    response
}
