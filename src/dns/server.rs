//! DNS server over UDP, TCP and DNS-over-TLS.
//!
//! # Responsibilities
//! - Bind the plain (UDP+TCP) and DoT (TCP) ports through a [`Binder`]
//! - Spawn one worker per socket on a shared [`WorkerGroup`]
//! - Bound graceful shutdown of stream listeners
//!
//! # Design Decisions
//! - The group is supplied by the owner; under an edge server it is a
//!   child group, so a DNS failure still cancels every sibling listener
//! - DoT is only bound when a TLS config is present

use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_rustls::TlsAcceptor;

use crate::dns::handler::DnsHandler;
use crate::dns::listener::{DnsListener, DnsSocket, QueryLimits};
use crate::error::{EdgeError, EdgeResult};
use crate::lifecycle::{ServerState, WorkerGroup};
use crate::net::bind::{close_all, BindConfig, Binder};
use crate::net::listener::{tokio_tcp, tokio_udp};

/// Port for plain DNS when none is configured.
pub const DEFAULT_PORT: u16 = 53;

/// Port for DNS-over-TLS when none is configured.
pub const DEFAULT_TLS_PORT: u16 = 853;

/// How the DNS server is assembled.
#[derive(Debug, Clone, Default)]
pub struct DnsConfig {
    pub addresses: Vec<IpAddr>,
    /// Plain port; unset is 53, 0 lets the OS pick.
    pub port: Option<u16>,
    /// DoT port; unset is 853, 0 lets the OS pick.
    pub tls_port: Option<u16>,
    pub port_strict: bool,
    pub port_attempts: u16,
    pub limits: QueryLimits,
    pub graceful_timeout: Duration,
    /// Enables DoT.
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

/// Sockets owned by a [`DnsServer`] until it serves.
#[derive(Debug, Default)]
pub struct DnsListeners {
    pub udp: Vec<UdpSocket>,
    pub tcp: Vec<TcpListener>,
    pub tls: Vec<TcpListener>,
}

impl DnsListeners {
    /// Close every socket, reporting all failures together.
    pub fn close(self) -> EdgeResult<()> {
        let mut errs = close_all(self.udp);
        errs.extend(close_all(self.tcp));
        errs.extend(close_all(self.tls));
        if errs.is_empty() {
            Ok(())
        } else {
            Err(EdgeError::Close(errs))
        }
    }
}

struct Inner {
    state: ServerState,
    listeners: Option<DnsListeners>,
    addrs: Vec<(&'static str, SocketAddr)>,
}

/// A DNS/DoT server built around a shared [`WorkerGroup`].
pub struct DnsServer {
    config: DnsConfig,
    group: WorkerGroup,
    inner: Mutex<Inner>,
}

impl DnsServer {
    pub fn new(config: DnsConfig, group: WorkerGroup) -> Self {
        Self {
            config,
            group,
            inner: Mutex::new(Inner {
                state: ServerState::Unbound,
                listeners: None,
                addrs: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Tell if DoT will be served.
    pub fn has_secure(&self) -> bool {
        self.config.tls.is_some()
    }

    /// Bind every configured address.
    pub fn listen(&self, binder: &Binder) -> EdgeResult<()> {
        let mut inner = self.lock();
        if inner.state != ServerState::Unbound {
            return Err(EdgeError::AlreadyRunning);
        }

        let bc = BindConfig {
            addresses: self.config.addresses.clone(),
            port_strict: self.config.port_strict,
            port_attempts: self.config.port_attempts,
            keep_alive: self.config.limits.keep_alive,
            ..BindConfig::default()
        };
        let plain = binder.bind(&bc.clone().with_port(self.config.port, DEFAULT_PORT))?;

        let mut listeners = DnsListeners {
            udp: plain.udp,
            tcp: plain.tcp,
            tls: Vec::new(),
        };

        if self.has_secure() {
            let bc = BindConfig {
                only_tcp: true,
                ..bc.with_port(self.config.tls_port, DEFAULT_TLS_PORT)
            };
            match binder.bind(&bc) {
                Ok(secure) => listeners.tls = secure.tcp,
                Err(err) => {
                    let _ = listeners.close();
                    return Err(err);
                }
            }
        }

        let mut addrs = Vec::new();
        collect_addrs(&mut addrs, "udp", listeners.udp.iter().map(|s| s.local_addr()));
        collect_addrs(&mut addrs, "tcp", listeners.tcp.iter().map(|l| l.local_addr()));
        collect_addrs(&mut addrs, "tcp+tls", listeners.tls.iter().map(|l| l.local_addr()));

        inner.state.bind()?;
        inner.listeners = Some(listeners);
        inner.addrs = addrs;
        Ok(())
    }

    /// Bound addresses by protocol (`udp`, `tcp`, `tcp+tls`).
    pub fn addrs(&self) -> Vec<(&'static str, SocketAddr)> {
        self.lock().addrs.clone()
    }

    /// Start one worker per socket, then give them `healthy` to fail.
    pub async fn spawn(&self, handler: Arc<dyn DnsHandler>, healthy: Duration) -> EdgeResult<()> {
        let listeners = {
            let mut inner = self.lock();
            inner.state.serve()?;
            inner
                .listeners
                .take()
                .ok_or_else(|| EdgeError::Invariant("bound dns server without listeners".into()))?
        };

        if let Err(err) = self.spawn_listeners(listeners, handler) {
            self.group.cancel(err.clone());
            return Err(err);
        }

        self.group.settle(healthy).await
    }

    fn spawn_listeners(&self, listeners: DnsListeners, handler: Arc<dyn DnsHandler>) -> EdgeResult<()> {
        let mut sockets = Vec::new();
        for udp in listeners.udp {
            sockets.push(DnsSocket::Udp(tokio_udp(udp)?));
        }
        for tcp in listeners.tcp {
            sockets.push(DnsSocket::Tcp(tokio_tcp(tcp)?));
        }
        if let Some(config) = &self.config.tls {
            let acceptor = TlsAcceptor::from(config.clone());
            for tcp in listeners.tls {
                sockets.push(DnsSocket::Tls(tokio_tcp(tcp)?, acceptor.clone()));
            }
        } else if !listeners.tls.is_empty() {
            return Err(EdgeError::Invariant("dns-over-tls listener without tls config".into()));
        }

        let grace = self.config.graceful_timeout;
        for socket in sockets {
            let (listener, handle) = DnsListener::new(socket, handler.clone(), self.config.limits)?;
            self.group.go_with_shutdown(
                move |_| listener.serve(),
                move || async move { handle.shutdown(grace).await },
            );
        }
        Ok(())
    }

    /// Spawn with no health wait, then wait for every worker.
    pub async fn serve(&self, handler: Arc<dyn DnsHandler>) -> EdgeResult<()> {
        self.spawn(handler, Duration::ZERO).await?;
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

fn collect_addrs(
    out: &mut Vec<(&'static str, SocketAddr)>,
    proto: &'static str,
    addrs: impl Iterator<Item = std::io::Result<SocketAddr>>,
) {
    out.extend(addrs.filter_map(Result::ok).map(|a| (proto, a)));
}
