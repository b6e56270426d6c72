//! Address/port configuration into bound sockets.
//!
//! # Responsibilities
//! - Bind every configured address on one shared port (TCP, and UDP unless TCP-only)
//! - Retry on successive ports when the desired one is busy
//! - Close partially bound sets on failure
//!
//! # Design Decisions
//! - `port_attempts` counts total tries, so the last port tried is
//!   `first + port_attempts - 1`
//! - Only `AddrInUse` is retried; any other failure is fatal immediately
//! - Port 0 (with no default) lets the OS pick, and the picked port is
//!   reused for the remaining addresses and for UDP

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EdgeError, EdgeResult};
use crate::net::provider::SocketProvider;

/// Default number of ports tried when the desired one is busy.
pub const DEFAULT_PORT_ATTEMPTS: u16 = 4;

/// What to bind.
#[derive(Debug, Clone)]
pub struct BindConfig {
    /// Addresses to bind; empty means `0.0.0.0` and `::`.
    pub addresses: Vec<IpAddr>,
    /// Desired port; 0 falls back to `default_port`.
    pub port: u16,
    /// Port used when `port` is 0.
    pub default_port: u16,
    /// Skip UDP.
    pub only_tcp: bool,
    /// Fail immediately if the port is busy.
    pub port_strict: bool,
    /// Total ports tried when not strict.
    pub port_attempts: u16,
    /// TCP keep-alive for accepted connections.
    pub keep_alive: Option<Duration>,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            port: 0,
            default_port: 0,
            only_tcp: false,
            port_strict: false,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            keep_alive: None,
        }
    }
}

impl BindConfig {
    /// Effective addresses to bind.
    pub fn addresses(&self) -> Vec<IpAddr> {
        if self.addresses.is_empty() {
            vec![
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ]
        } else {
            self.addresses.clone()
        }
    }

    /// First port tried.
    pub fn first_port(&self) -> u16 {
        if self.port == 0 {
            self.default_port
        } else {
            self.port
        }
    }

    /// Apply a configured port: unset falls back to `default`, 0 lets the
    /// OS pick.
    pub fn with_port(mut self, port: Option<u16>, default: u16) -> Self {
        match port {
            Some(port) => {
                self.port = port;
                self.default_port = 0;
            }
            None => {
                self.port = 0;
                self.default_port = default;
            }
        }
        self
    }

    fn attempts(&self) -> u16 {
        if self.port_strict {
            1
        } else {
            self.port_attempts.max(1)
        }
    }
}

/// Sockets produced by one [`Binder::bind`] call.
#[derive(Debug, Default)]
pub struct BoundSockets {
    pub tcp: Vec<TcpListener>,
    pub udp: Vec<UdpSocket>,
    /// Port every socket ended up on.
    pub port: u16,
}

/// Turns a [`BindConfig`] into sockets through a [`SocketProvider`].
#[derive(Clone)]
pub struct Binder {
    provider: Arc<dyn SocketProvider>,
}

impl Binder {
    pub fn new(provider: Arc<dyn SocketProvider>) -> Self {
        Self { provider }
    }

    /// Bind all addresses, retrying successive ports as configured.
    pub fn bind(&self, cfg: &BindConfig) -> EdgeResult<BoundSockets> {
        let addrs = cfg.addresses();
        let first = cfg.first_port();
        let mut last = first;
        let mut conflict = None;

        for i in 0..cfg.attempts() {
            let port = if first == 0 {
                0
            } else {
                match first.checked_add(i) {
                    Some(port) => port,
                    None => break,
                }
            };
            last = port;

            match self.try_bind(cfg, &addrs, port) {
                Ok(bound) => {
                    if port != first {
                        tracing::warn!(desired = first, port = bound.port, "Desired port busy, bound next one");
                    }
                    return Ok(bound);
                }
                Err((addr, err)) if err.kind() == io::ErrorKind::AddrInUse => {
                    tracing::debug!(%addr, port, "Port busy");
                    conflict = Some((addr, err));
                }
                Err((addr, err)) => {
                    return Err(EdgeError::Bind {
                        addr,
                        first,
                        last: port,
                        source: Arc::new(err),
                    });
                }
            }
        }

        let (addr, err) = conflict.unwrap_or_else(|| {
            (
                addrs[0],
                io::Error::new(io::ErrorKind::AddrNotAvailable, "port range exhausted"),
            )
        });
        Err(EdgeError::Bind {
            addr,
            first,
            last,
            source: Arc::new(err),
        })
    }

    fn try_bind(
        &self,
        cfg: &BindConfig,
        addrs: &[IpAddr],
        mut port: u16,
    ) -> Result<BoundSockets, (IpAddr, io::Error)> {
        let mut bound = BoundSockets::default();

        for &ip in addrs {
            let tcp = self
                .provider
                .listen_tcp(SocketAddr::new(ip, port))
                .map_err(|e| (ip, e))?;
            if port == 0 {
                port = tcp.local_addr().map_err(|e| (ip, e))?.port();
            }
            bound.tcp.push(tcp);

            if !cfg.only_tcp {
                let udp = self
                    .provider
                    .listen_udp(SocketAddr::new(ip, port))
                    .map_err(|e| (ip, e))?;
                bound.udp.push(udp);
            }
        }

        bound.port = port;
        Ok(bound)
    }
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binder").finish_non_exhaustive()
    }
}

/// Close sockets one by one, collecting every failure.
#[cfg(unix)]
pub fn close_all<S: std::os::fd::IntoRawFd>(sockets: impl IntoIterator<Item = S>) -> Vec<Arc<io::Error>> {
    sockets
        .into_iter()
        .filter_map(|s| nix::unistd::close(s.into_raw_fd()).err())
        .map(|errno| Arc::new(io::Error::from(errno)))
        .collect()
}

/// Close sockets one by one, collecting every failure.
#[cfg(not(unix))]
pub fn close_all<S>(sockets: impl IntoIterator<Item = S>) -> Vec<Arc<io::Error>> {
    sockets.into_iter().for_each(drop);
    Vec::new()
}
