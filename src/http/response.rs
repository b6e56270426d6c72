//! Canned responses.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

/// 403 with a plain-text `forbidden` body.
pub fn forbidden() -> impl IntoResponse {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/plain")],
        "forbidden",
    )
}

/// 404 with a plain-text `not found` body.
pub fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain")],
        "not found",
    )
}
