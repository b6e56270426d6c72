//! ACME HTTP-01 challenge routing.
//!
//! Requests for `/.well-known/acme-challenge/<token>` go to the configured
//! challenge app when the token is a single non-empty segment, and get 404
//! otherwise. Every other path passes through.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceExt;

use crate::http::response::not_found;

/// Path prefix of HTTP-01 challenges.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Challenge app shared by every HTTP listener.
pub type AcmeHandler = Option<Router>;

/// Token of a challenge request; `Some("")` for a malformed one.
fn challenge_token(path: &str) -> Option<&str> {
    if path == ACME_CHALLENGE_PREFIX.trim_end_matches('/') {
        return Some("");
    }
    let token = path.strip_prefix(ACME_CHALLENGE_PREFIX)?;
    if token.contains('/') {
        return Some("");
    }
    Some(token)
}

/// Middleware answering challenge requests before the app sees them.
pub async fn acme_challenge(State(handler): State<AcmeHandler>, req: Request, next: Next) -> Response {
    let token = match challenge_token(req.uri().path()) {
        None => return next.run(req).await,
        Some(token) => token,
    };

    match handler {
        Some(app) if !token.is_empty() => {
            tracing::debug!(token, "Serving ACME challenge");
            match app.oneshot(req).await {
                Ok(res) => res,
                Err(never) => match never {},
            }
        }
        _ => not_found().into_response(),
    }
}
