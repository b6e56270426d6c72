//! Plain-HTTP to HTTPS redirection.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Router;

/// An app redirecting every request to `https://` on `secure_port`.
pub fn https_redirect(secure_port: u16) -> Router {
    Router::new().fallback(redirect).with_state(secure_port)
}

async fn redirect(State(port): State<u16>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host());

    let Some(host) = host else {
        return (StatusCode::BAD_REQUEST, "missing host").into_response();
    };

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Redirect::permanent(&https_location(host, port, path)).into_response()
}

/// Target of a redirect for `host` (which may carry a port).
pub fn https_location(host: &str, port: u16, path: &str) -> String {
    let host = strip_port(host);
    if port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{port}{path}")
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
