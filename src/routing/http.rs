//! Horizon dispatch for HTTP requests.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceExt;

use crate::http::response::forbidden;
use crate::observability::metrics::record_http_forbidden;
use crate::routing::horizon::HorizonRouter;

impl HorizonRouter {
    /// An HTTP app dispatching every request to its client's horizon.
    ///
    /// The remote address is read from [`ConnectInfo`]; requests without
    /// one, or from outside every horizon, get 403 `forbidden`. The
    /// horizon's app sees the [`Match`](crate::routing::Match) as a
    /// request extension.
    pub fn into_http(self: Arc<Self>) -> Router {
        Router::new().fallback(dispatch).with_state(self)
    }
}

async fn dispatch(State(router): State<Arc<HorizonRouter>>, mut req: Request) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let Some((horizon, m)) = remote.and_then(|addr| router.match_addr(addr)) else {
        record_http_forbidden();
        tracing::debug!(remote = ?remote, path = %req.uri().path(), "No horizon for request");
        return forbidden().into_response();
    };

    let app = horizon.http().clone();
    req.extensions_mut().insert(m);
    match app.oneshot(req).await {
        Ok(res) => res,
        Err(never) => match never {},
    }
}
