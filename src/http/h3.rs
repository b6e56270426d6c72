//! HTTP/3 serve loop for one QUIC endpoint.
//!
//! # Responsibilities
//! - Accept QUIC connections and serve their request streams with the app
//! - Publish the endpoint's `Alt-Svc` advertisement once serving
//! - On stop, send GOAWAY and let in-flight requests finish

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response};
use axum::Router;
use bytes::{Buf, Bytes, BytesMut};
use http_body_util::BodyExt;
use quinn::{Endpoint, EndpointConfig, TokioRuntime};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceExt;

use crate::error::{EdgeError, EdgeResult};
use crate::net::connection::ConnectionTracker;
use crate::observability::metrics::ActiveListener;

/// Lifetime advertised in `Alt-Svc`, in seconds.
pub const ALT_SVC_MAX_AGE: u32 = 2_592_000;

type RequestStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// One QUIC endpoint serving an app over HTTP/3.
pub struct H3Listener {
    endpoint: Endpoint,
    local: SocketAddr,
    app: Router,
    alt_svc: Arc<OnceLock<String>>,
    stop: watch::Receiver<bool>,
    tracker: ConnectionTracker,
}

/// Stops a running [`H3Listener`].
#[derive(Debug, Clone)]
pub struct H3Handle {
    endpoint: Endpoint,
    local: SocketAddr,
    stop: Arc<watch::Sender<bool>>,
    tracker: ConnectionTracker,
}

impl H3Listener {
    /// Open a QUIC endpoint on `socket`.
    pub fn new(socket: UdpSocket, config: quinn::ServerConfig, app: Router) -> io::Result<(Self, H3Handle)> {
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            Some(config),
            socket,
            Arc::new(TokioRuntime),
        )?;
        let local = endpoint.local_addr()?;
        let (stop_tx, stop) = watch::channel(false);
        let tracker = ConnectionTracker::new();

        let handle = H3Handle {
            endpoint: endpoint.clone(),
            local,
            stop: Arc::new(stop_tx),
            tracker: tracker.clone(),
        };
        let listener = Self {
            endpoint,
            local,
            app,
            alt_svc: Arc::new(OnceLock::new()),
            stop,
            tracker,
        };
        Ok((listener, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Set once the endpoint serves.
    pub fn alt_svc(&self) -> Arc<OnceLock<String>> {
        self.alt_svc.clone()
    }

    /// Serve until the endpoint closes.
    pub async fn serve(self) -> EdgeResult<()> {
        let _active = ActiveListener::new("h3");
        tracing::info!(proto = "h3", address = %self.local, "Listening");
        let _ = self
            .alt_svc
            .set(format!("h3=\":{}\"; ma={}", self.local.port(), ALT_SVC_MAX_AGE));

        loop {
            let incoming = tokio::select! {
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => return Ok(()),
                },
                _ = stopped(self.stop.clone()) => {
                    // refuse new connections, keep serving the live ones
                    self.endpoint.set_server_config(None);
                    return Ok(());
                }
            };

            let guard = self.tracker.track();
            let app = self.app.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move {
                let conn_id = guard.id();
                let remote = incoming.remote_address();
                if let Err(e) = serve_conn(incoming, app, stop).await {
                    tracing::debug!(connection_id = %conn_id, %remote, error = %e, "HTTP/3 connection ended");
                }
                drop(guard);
            });
        }
    }
}

impl H3Handle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop accepting, wait up to `grace` for connections to finish, then
    /// close the endpoint. A zero `grace` waits without bound.
    pub async fn shutdown(&self, grace: Duration) -> EdgeResult<()> {
        tracing::debug!(proto = "h3", address = %self.local, "Shutting down");
        self.stop.send_replace(true);

        let drained = if grace.is_zero() {
            self.tracker.idle().await;
            true
        } else {
            self.tracker.drain(grace).await
        };
        self.endpoint.close(0u32.into(), b"shutdown");

        if drained {
            Ok(())
        } else {
            Err(EdgeError::ShutdownTimedOut(grace))
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn serve_conn(incoming: quinn::Incoming, app: Router, stop: watch::Receiver<bool>) -> Result<(), BoxError> {
    let conn = incoming.await?;
    let remote = conn.remote_address();
    let mut conn = h3::server::Connection::<_, Bytes>::new(h3_quinn::Connection::new(conn)).await?;

    let mut requests = JoinSet::new();
    let mut closing = *stop.borrow();
    if closing {
        conn.shutdown(0).await?;
    }

    loop {
        tokio::select! {
            accepted = conn.accept() => match accepted {
                Ok(Some((req, stream))) => {
                    let app = app.clone();
                    requests.spawn(async move {
                        if let Err(e) = serve_request(app, req, stream, remote).await {
                            tracing::debug!(%remote, error = %e, "HTTP/3 request failed");
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%remote, error = %e, "HTTP/3 accept failed");
                    break;
                }
            },
            _ = stopped(stop.clone()), if !closing => {
                closing = true;
                conn.shutdown(0).await?;
            }
        }
    }

    while requests.join_next().await.is_some() {}
    Ok(())
}

async fn serve_request(app: Router, req: Request<()>, mut stream: RequestStream, remote: SocketAddr) -> Result<(), BoxError> {
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        let len = chunk.remaining();
        body.extend_from_slice(&chunk.copy_to_bytes(len));
    }

    let (parts, ()) = req.into_parts();
    let mut req = Request::from_parts(parts, Body::from(body.freeze()));
    req.extensions_mut().insert(ConnectInfo(remote));

    let res = match app.oneshot(req).await {
        Ok(res) => res,
        Err(never) => match never {},
    };

    let (parts, mut body) = res.into_parts();
    stream.send_response(Response::from_parts(parts, ())).await?;
    while let Some(frame) = body.frame().await {
        match frame?.into_data() {
            Ok(data) => stream.send_data(data).await?,
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    stream.send_trailers(trailers).await?;
                }
            }
        }
    }
    stream.finish().await?;
    Ok(())
}
