//! HTTP/1.1 and HTTP/2 serve loop for one TCP listener.
//!
//! # Responsibilities
//! - Accept connections, optionally terminating TLS
//! - Serve each connection with HTTP/1.1 or HTTP/2 (h2c on plain sockets)
//! - Hand the remote address to the app as [`ConnectInfo`]
//! - On stop, close idle connections and let in-flight requests finish
//!
//! # Design Decisions
//! - One task per connection, tracked for the shutdown drain
//! - Protocol is detected per connection (ALPN or the HTTP/2 preface)

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

use crate::error::{EdgeError, EdgeResult};
use crate::net::bind::close_all;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{configure_stream, is_transient, tls_handshake, tokio_tcp, ACCEPT_BACKOFF};
use crate::observability::metrics::ActiveListener;

/// Sockets owned by an HTTP server until it serves.
#[derive(Debug, Default)]
pub struct HttpListeners {
    /// Plain HTTP (h2c).
    pub insecure: Vec<StdTcpListener>,
    /// HTTPS (h2).
    pub secure: Vec<StdTcpListener>,
    /// HTTP/3.
    pub quic: Vec<UdpSocket>,
}

impl HttpListeners {
    pub fn is_empty(&self) -> bool {
        self.insecure.is_empty() && self.secure.is_empty() && self.quic.is_empty()
    }

    /// Close every socket, reporting all failures together.
    pub fn close(self) -> EdgeResult<()> {
        let mut errs = close_all(self.insecure);
        errs.extend(close_all(self.secure));
        errs.extend(close_all(self.quic));
        if errs.is_empty() {
            Ok(())
        } else {
            Err(EdgeError::Close(errs))
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnOptions {
    /// Bound on reading request headers (and the TLS handshake); zero is none.
    pub read_header_timeout: Duration,
    /// HTTP/2 keep-alive ping interval; zero is none.
    pub idle_timeout: Duration,
    /// TCP keep-alive.
    pub keep_alive: Option<Duration>,
}

/// One TCP listener serving an app.
pub struct HttpListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    local: SocketAddr,
    app: Router,
    options: ConnOptions,
    stop: watch::Receiver<bool>,
    tracker: ConnectionTracker,
}

/// Stops a running [`HttpListener`].
#[derive(Debug, Clone)]
pub struct HttpHandle {
    proto: &'static str,
    local: SocketAddr,
    stop: Arc<watch::Sender<bool>>,
    tracker: ConnectionTracker,
}

impl HttpListener {
    pub fn new(
        listener: StdTcpListener,
        tls: Option<Arc<rustls::ServerConfig>>,
        app: Router,
        options: ConnOptions,
    ) -> io::Result<(Self, HttpHandle)> {
        let listener = tokio_tcp(listener)?;
        let local = listener.local_addr()?;
        let tls = tls.map(TlsAcceptor::from);
        let (stop_tx, stop) = watch::channel(false);
        let tracker = ConnectionTracker::new();

        let handle = HttpHandle {
            proto: proto(tls.is_some()),
            local,
            stop: Arc::new(stop_tx),
            tracker: tracker.clone(),
        };
        let listener = Self {
            listener,
            tls,
            local,
            app,
            options,
            stop,
            tracker,
        };
        Ok((listener, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Serve until stopped. Returns `Ok(())` on a requested stop.
    pub async fn serve(self) -> EdgeResult<()> {
        let proto = proto(self.tls.is_some());
        let _active = ActiveListener::new(proto);
        tracing::info!(proto, address = %self.local, "Listening");

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder.http1().timer(TokioTimer::new());
        if !self.options.read_header_timeout.is_zero() {
            builder.http1().header_read_timeout(self.options.read_header_timeout);
        }
        if !self.options.idle_timeout.is_zero() {
            builder
                .http2()
                .timer(TokioTimer::new())
                .keep_alive_interval(self.options.idle_timeout);
        }

        loop {
            let (stream, remote) = tokio::select! {
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "Transient accept error");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                    Err(e) => return Err(EdgeError::listener(proto, self.local, e)),
                },
                _ = stopped(self.stop.clone()) => return Ok(()),
            };

            configure_stream(&stream, self.options.keep_alive);
            let guard = self.tracker.track();
            let conn = Conn {
                builder: builder.clone(),
                app: self.app.clone(),
                remote,
                stop: self.stop.clone(),
            };
            let tls = self.tls.clone();
            let handshake_timeout = self.options.read_header_timeout;

            tokio::spawn(async move {
                let conn_id = guard.id();
                let res = match tls {
                    Some(acceptor) => match tls_handshake(acceptor, stream, handshake_timeout).await {
                        Ok(stream) => conn.serve(stream).await,
                        Err(e) => Err(e.into()),
                    },
                    None => conn.serve(stream).await,
                };
                if let Err(e) = res {
                    tracing::debug!(connection_id = %conn_id, %remote, error = %e, "HTTP connection ended");
                }
                drop(guard);
            });
        }
    }
}

impl HttpHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop accepting, then wait up to `grace` for connections to finish
    /// their in-flight requests. A zero `grace` waits without bound.
    pub async fn shutdown(&self, grace: Duration) -> EdgeResult<()> {
        tracing::debug!(proto = self.proto, address = %self.local, "Shutting down");
        self.stop.send_replace(true);

        if grace.is_zero() {
            self.tracker.idle().await;
            return Ok(());
        }
        if self.tracker.drain(grace).await {
            Ok(())
        } else {
            Err(EdgeError::ShutdownTimedOut(grace))
        }
    }
}

fn proto(secure: bool) -> &'static str {
    if secure {
        "h2"
    } else {
        "h2c"
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

struct Conn {
    builder: auto::Builder<TokioExecutor>,
    app: Router,
    remote: SocketAddr,
    stop: watch::Receiver<bool>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl Conn {
    async fn serve<S>(self, stream: S) -> Result<(), BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Conn {
            builder,
            app,
            remote,
            stop,
        } = self;

        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let mut req = req.map(Body::new);
            req.extensions_mut().insert(ConnectInfo(remote));
            app.clone().oneshot(req)
        });

        let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
        tokio::pin!(conn);

        tokio::select! {
            res = conn.as_mut() => res,
            _ = stopped(stop) => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        }
    }
}
