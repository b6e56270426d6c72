//! HTTP server over plain TCP, TLS and QUIC.
//!
//! # Responsibilities
//! - Bind the insecure (h2c) and secure (h2 + h3) ports through a [`Binder`]
//! - Compose the app per listener: HTTPS redirect, ACME challenges,
//!   `Alt-Svc` injection, request timeout, tracing
//! - Spawn one worker per socket on a shared [`WorkerGroup`]
//!
//! # Design Decisions
//! - Plain listeners serve the app only when insecure traffic is allowed,
//!   otherwise they redirect to HTTPS
//! - `Alt-Svc` is learned from the HTTP/3 endpoints after they start and
//!   injected on h2c and h2 responses

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware::{from_fn_with_state, map_response_with_state};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::{EdgeError, EdgeResult};
use crate::http::acme::{acme_challenge, AcmeHandler};
use crate::http::alt_svc::{discover, inject_alt_svc, AltSvc};
use crate::http::h3::H3Listener;
use crate::http::listeners::{ConnOptions, HttpListener, HttpListeners};
use crate::http::redirect::https_redirect;
use crate::lifecycle::{ServerState, WorkerGroup};
use crate::net::bind::{BindConfig, Binder};

/// Secure port when none is configured.
pub const DEFAULT_SECURE_PORT: u16 = 443;

/// Insecure port when none is configured.
pub const DEFAULT_INSECURE_PORT: u16 = 80;

/// How the HTTP server is assembled.
#[derive(Clone, Default)]
pub struct HttpConfig {
    pub addresses: Vec<IpAddr>,
    /// Secure port (TCP and QUIC); unset is 443, 0 lets the OS pick.
    pub port: Option<u16>,
    /// Insecure port; unset is 80, 0 lets the OS pick.
    pub insecure_port: Option<u16>,
    pub port_strict: bool,
    pub port_attempts: u16,
    pub keep_alive: Option<Duration>,
    /// Listen on the insecure port.
    pub enable_insecure: bool,
    /// Serve the app on the insecure port instead of redirecting.
    pub allow_insecure: bool,
    pub read_header_timeout: Duration,
    /// Per-request handling bound; zero is none.
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub graceful_timeout: Duration,
    /// Enables HTTPS.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Enables HTTP/3, with `tls`.
    pub quic: Option<quinn::ServerConfig>,
    /// Answers ACME HTTP-01 challenges.
    pub acme: AcmeHandler,
}

impl std::fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConfig")
            .field("addresses", &self.addresses)
            .field("port", &self.port)
            .field("insecure_port", &self.insecure_port)
            .field("enable_insecure", &self.enable_insecure)
            .field("allow_insecure", &self.allow_insecure)
            .field("tls", &self.tls.is_some())
            .field("quic", &self.quic.is_some())
            .field("acme", &self.acme.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpConfig {
    fn bind_config(&self) -> BindConfig {
        BindConfig {
            addresses: self.addresses.clone(),
            port_strict: self.port_strict,
            port_attempts: self.port_attempts,
            keep_alive: self.keep_alive,
            ..BindConfig::default()
        }
    }

    fn has_insecure(&self) -> bool {
        self.enable_insecure || self.allow_insecure
    }

    fn conn_options(&self) -> ConnOptions {
        ConnOptions {
            read_header_timeout: self.read_header_timeout,
            idle_timeout: self.idle_timeout,
            keep_alive: self.keep_alive,
        }
    }
}

struct Inner {
    state: ServerState,
    listeners: Option<HttpListeners>,
    addrs: Vec<(&'static str, SocketAddr)>,
    secure_port: Option<u16>,
}

/// An HTTP/1.1, HTTP/2 and HTTP/3 server built around a shared
/// [`WorkerGroup`].
pub struct HttpServer {
    config: HttpConfig,
    group: WorkerGroup,
    alt_svc: AltSvc,
    inner: Mutex<Inner>,
}

impl HttpServer {
    pub fn new(config: HttpConfig, group: WorkerGroup) -> Self {
        Self {
            config,
            group,
            alt_svc: AltSvc::new(),
            inner: Mutex::new(Inner {
                state: ServerState::Unbound,
                listeners: None,
                addrs: Vec::new(),
                secure_port: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Tell if HTTPS will be served.
    pub fn has_secure(&self) -> bool {
        self.config.tls.is_some()
    }

    /// The shared `Alt-Svc` advertisement.
    pub fn alt_svc(&self) -> &AltSvc {
        &self.alt_svc
    }

    /// Bind every configured address.
    pub fn listen(&self, binder: &Binder) -> EdgeResult<()> {
        let mut inner = self.lock();
        if inner.state != ServerState::Unbound {
            return Err(EdgeError::AlreadyRunning);
        }

        let mut listeners = HttpListeners::default();
        let mut secure_port = None;

        if self.has_secure() {
            let bc = BindConfig {
                only_tcp: self.config.quic.is_none(),
                ..self
                    .config
                    .bind_config()
                    .with_port(self.config.port, DEFAULT_SECURE_PORT)
            };
            let bound = binder.bind(&bc)?;
            secure_port = Some(bound.port);
            listeners.secure = bound.tcp;
            listeners.quic = bound.udp;
        }

        if self.config.has_insecure() {
            let bc = BindConfig {
                only_tcp: true,
                ..self
                    .config
                    .bind_config()
                    .with_port(self.config.insecure_port, DEFAULT_INSECURE_PORT)
            };
            match binder.bind(&bc) {
                Ok(bound) => listeners.insecure = bound.tcp,
                Err(err) => {
                    let _ = listeners.close();
                    return Err(err);
                }
            }
        }

        let mut addrs = Vec::new();
        addrs.extend(listeners.insecure.iter().filter_map(|l| l.local_addr().ok()).map(|a| ("h2c", a)));
        addrs.extend(listeners.secure.iter().filter_map(|l| l.local_addr().ok()).map(|a| ("h2", a)));
        addrs.extend(listeners.quic.iter().filter_map(|s| s.local_addr().ok()).map(|a| ("h3", a)));

        inner.state.bind()?;
        inner.listeners = Some(listeners);
        inner.addrs = addrs;
        inner.secure_port = secure_port;
        Ok(())
    }

    /// Bound addresses by protocol (`h2c`, `h2`, `h3`).
    pub fn addrs(&self) -> Vec<(&'static str, SocketAddr)> {
        self.lock().addrs.clone()
    }

    /// Start one worker per socket, then give them `healthy` to fail.
    pub async fn spawn(&self, app: Router, healthy: Duration) -> EdgeResult<()> {
        let (listeners, secure_port) = {
            let mut inner = self.lock();
            inner.state.serve()?;
            let listeners = inner
                .listeners
                .take()
                .ok_or_else(|| EdgeError::Invariant("bound http server without listeners".into()))?;
            (listeners, inner.secure_port)
        };

        if listeners.is_empty() {
            self.lock().state.stopped();
            return Err(EdgeError::NotListening);
        }

        if let Err(err) = self.spawn_listeners(listeners, app, secure_port) {
            self.group.cancel(err.clone());
            return Err(err);
        }

        self.group.settle(healthy).await
    }

    fn spawn_listeners(&self, listeners: HttpListeners, app: Router, secure_port: Option<u16>) -> EdgeResult<()> {
        let options = self.config.conn_options();
        let grace = self.config.graceful_timeout;

        if !listeners.insecure.is_empty() {
            let handler = if self.config.allow_insecure {
                app.clone()
            } else {
                let port = secure_port
                    .or(self.config.port.filter(|p| *p != 0))
                    .unwrap_or(DEFAULT_SECURE_PORT);
                https_redirect(port)
            };
            let handler = self.compose(handler, true);
            for tcp in listeners.insecure {
                let (listener, handle) = HttpListener::new(tcp, None, handler.clone(), options)?;
                self.group.go_with_shutdown(
                    move |_| listener.serve(),
                    move || async move { handle.shutdown(grace).await },
                );
            }
        }

        if !listeners.secure.is_empty() {
            let tls = self
                .config
                .tls
                .clone()
                .ok_or_else(|| EdgeError::Invariant("secure listener without tls config".into()))?;
            let handler = self.compose(app.clone(), true);
            for tcp in listeners.secure {
                let (listener, handle) = HttpListener::new(tcp, Some(tls.clone()), handler.clone(), options)?;
                self.group.go_with_shutdown(
                    move |_| listener.serve(),
                    move || async move { handle.shutdown(grace).await },
                );
            }
        }

        if !listeners.quic.is_empty() {
            let quic = self
                .config
                .quic
                .clone()
                .ok_or_else(|| EdgeError::Invariant("quic listener without quic config".into()))?;
            let handler = self.compose(app, false);
            for udp in listeners.quic {
                let (listener, handle) = H3Listener::new(udp, quic.clone(), handler.clone())?;
                let source = listener.alt_svc();
                let alt_svc = self.alt_svc.clone();
                self.group.go(move |ctx| async move {
                    discover(source, alt_svc, ctx).await;
                    Ok(())
                });
                self.group.go_with_shutdown(
                    move |_| listener.serve(),
                    move || async move { handle.shutdown(grace).await },
                );
            }
        }

        Ok(())
    }

    /// Wrap `app` with the middleware every listener shares.
    fn compose(&self, app: Router, advertise: bool) -> Router {
        let mut router = Router::new()
            .fallback_service(app)
            .layer(from_fn_with_state(self.config.acme.clone(), acme_challenge));
        if advertise {
            router = router.layer(map_response_with_state(self.alt_svc.clone(), inject_alt_svc));
        }
        if !self.config.write_timeout.is_zero() {
            router = router.layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.config.write_timeout,
            ));
        }
        router.layer(TraceLayer::new_for_http())
    }

    /// Spawn with no health wait, then wait for every worker.
    pub async fn serve(&self, app: Router) -> EdgeResult<()> {
        self.spawn(app, Duration::ZERO).await?;
        self.wait().await
    }

    pub fn cancel(&self, cause: EdgeError) {
        self.group.cancel(cause);
    }

    /// Wait for every worker, then record the server as stopped.
    pub async fn wait(&self) -> EdgeResult<()> {
        let res = self.group.wait().await;
        let mut inner = self.lock();
        if inner.state.has_started() {
            inner.state.stopped();
        }
        res
    }

    pub fn err(&self) -> Option<EdgeError> {
        self.group.err()
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Cancel if serving, and close sockets not yet handed to workers.
    ///
    /// Idempotent.
    pub fn close(&self) -> EdgeResult<()> {
        let listeners = {
            let mut inner = self.lock();
            match inner.state {
                ServerState::Serving => {
                    self.group.cancel(EdgeError::Cancelled);
                    inner.state.shutting_down();
                }
                // closed before serving: never serve
                ServerState::Bound => inner.state.stopped(),
                _ => {}
            }
            inner.listeners.take()
        };
        match listeners {
            Some(listeners) => listeners.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::net::provider::PlainSockets;
    use axum::routing::get;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> HttpConfig {
        HttpConfig {
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port: Some(0),
            insecure_port: Some(0),
            port_attempts: 1,
            enable_insecure: true,
            graceful_timeout: Duration::from_secs(1),
            ..HttpConfig::default()
        }
    }

    fn binder() -> Binder {
        Binder::new(Arc::new(PlainSockets))
    }

    async fn get_raw(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: edge.test\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    fn app() -> Router {
        Router::new().route("/", get(|| async { "app" }))
    }

    #[tokio::test]
    async fn spawn_before_listen_is_not_listening() {
        let srv = HttpServer::new(config(), WorkerGroup::new());
        let err = srv.spawn(app(), Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotListening);
    }

    #[tokio::test]
    async fn nothing_to_serve_is_not_listening() {
        let cfg = HttpConfig {
            enable_insecure: false,
            ..config()
        };
        let srv = HttpServer::new(cfg, WorkerGroup::new());
        srv.listen(&binder()).unwrap();
        assert!(srv.addrs().is_empty());
        let err = srv.spawn(app(), Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotListening);
    }

    #[tokio::test]
    async fn insecure_redirects_unless_allowed() {
        let srv = HttpServer::new(config(), WorkerGroup::new());
        srv.listen(&binder()).unwrap();
        let (proto, addr) = srv.addrs()[0];
        assert_eq!(proto, "h2c");
        srv.spawn(app(), Duration::ZERO).await.unwrap();

        let res = get_raw(addr, "/a?b=1").await;
        assert!(res.starts_with("HTTP/1.1 308"), "{res}");
        assert!(res.to_ascii_lowercase().contains("location: https://edge.test/a?b=1"), "{res}");

        srv.close().unwrap();
        srv.wait().await.unwrap();
    }

    #[tokio::test]
    async fn allowed_insecure_serves_app() {
        let cfg = HttpConfig {
            allow_insecure: true,
            enable_insecure: false,
            ..config()
        };
        let srv = HttpServer::new(cfg, WorkerGroup::new());
        srv.listen(&binder()).unwrap();
        srv.spawn(app(), Duration::from_millis(20)).await.unwrap();

        let (_, addr) = srv.addrs()[0];
        let res = get_raw(addr, "/").await;
        assert!(res.starts_with("HTTP/1.1 200"), "{res}");
        assert!(res.ends_with("app"), "{res}");

        let res = get_raw(addr, "/.well-known/acme-challenge/tok").await;
        assert!(res.starts_with("HTTP/1.1 404"), "{res}");

        srv.alt_svc().merge("h3=\":8443\"; ma=2592000");
        let res = get_raw(addr, "/").await;
        assert!(res.to_ascii_lowercase().contains("alt-svc: h3=\":8443\"; ma=2592000"), "{res}");

        srv.close().unwrap();
        assert_eq!(srv.state(), ServerState::ShuttingDown);
        srv.close().unwrap();
        srv.wait().await.unwrap();
        assert_eq!(srv.state(), ServerState::Stopped);
        assert!(matches!(
            srv.spawn(app(), Duration::ZERO).await,
            Err(EdgeError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn slow_handler_times_out_with_408() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let cfg = HttpConfig {
            write_timeout: Duration::from_millis(50),
            ..config()
        };
        let srv = HttpServer::new(cfg, WorkerGroup::new());
        let slow = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );

        let res = srv
            .compose(slow, false)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
