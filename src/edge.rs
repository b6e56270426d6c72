//! Edge server orchestration.
//!
//! # Responsibilities
//! - Own the HTTP and DNS servers (either optional), each on a child of
//!   one [`WorkerGroup`]
//! - Route both through one [`HorizonRouter`]
//! - Expose spawn, shutdown, cancel and wait for the whole process
//! - Supervise the process: readiness, signals, hot handoff
//!
//! # Design Decisions
//! - A failure in any listener cancels every other listener; cancelling
//!   one server alone leaves the other serving
//! - Shutdown timeouts are reported, never enforced: tasks that outlive
//!   the timeout keep draining in the background

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::EdgeConfig;
use crate::dns::listener::QueryLimits;
use crate::dns::server::{DnsConfig, DnsServer};
use crate::error::{EdgeError, EdgeResult};
use crate::http::server::{HttpConfig, HttpServer};
use crate::lifecycle::{Reloader, SignalEvent, WorkerGroup};
use crate::net::bind::Binder;
use crate::net::provider::{PlainSockets, SocketProvider};
use crate::net::tls::{dot_config, https_config, quic_config, CertificateStore, FileStore};
use crate::routing::{ExchangeTimeout, Horizon, HorizonRouter};

/// What an [`EdgeServer`] runs.
#[derive(Debug, Clone, Default)]
pub struct EdgeOptions {
    pub http: Option<HttpConfig>,
    pub dns: Option<DnsConfig>,
    /// Time given to listeners to fail at start-up.
    pub health_wait: Duration,
    /// Bound on the final shutdown of [`EdgeServer::listen_and_serve`].
    pub graceful_timeout: Duration,
    pub pid_file: Option<PathBuf>,
}

impl EdgeOptions {
    /// Derive server options from a validated configuration, loading
    /// certificates from disk.
    pub fn from_config(config: &EdgeConfig) -> EdgeResult<Self> {
        let store: Option<Arc<dyn CertificateStore>> = match &config.tls {
            Some(tls) => {
                let store = FileStore::load(&tls.cert, &tls.key, tls.roots.as_deref())?;
                Some(Arc::new(store) as Arc<dyn CertificateStore>)
            }
            None => None,
        };

        let addrs = &config.addresses;
        let graceful_timeout = config.supervision.graceful_timeout();

        let h = &config.http;
        let http = if store.is_some() || h.has_insecure() {
            let tls = store.as_ref().map(|s| https_config(s, h.mtls_only)).transpose()?;
            let quic = match &store {
                Some(s) if h.enable_quic => Some(quic_config(s, h.mtls_only)?),
                _ => None,
            };
            Some(HttpConfig {
                addresses: addrs.addresses.clone(),
                port: Some(h.effective_port()),
                insecure_port: Some(h.effective_insecure_port()),
                port_strict: addrs.port_strict,
                port_attempts: addrs.port_attempts,
                keep_alive: addrs.keep_alive(),
                enable_insecure: h.enable_insecure,
                allow_insecure: h.allow_insecure,
                read_header_timeout: Duration::from_secs(h.read_header_timeout_secs),
                write_timeout: Duration::from_secs(h.write_timeout_secs),
                idle_timeout: Duration::from_secs(h.idle_timeout_secs),
                graceful_timeout,
                tls,
                quic,
                acme: None,
            })
        } else {
            None
        };

        let d = &config.dns;
        let dns = if d.enabled {
            Some(DnsConfig {
                addresses: addrs.addresses.clone(),
                port: Some(d.effective_port()),
                tls_port: Some(d.effective_tls_port()),
                port_strict: addrs.port_strict,
                port_attempts: addrs.port_attempts,
                limits: QueryLimits {
                    read_timeout: Duration::from_secs(d.read_timeout_secs),
                    idle_timeout: Duration::from_secs(d.idle_timeout_secs),
                    max_tcp_queries: d.max_tcp_queries,
                    keep_alive: addrs.keep_alive(),
                },
                graceful_timeout,
                tls: store.as_ref().map(|s| dot_config(s, d.mtls_only)).transpose()?,
            })
        } else {
            None
        };

        Ok(Self {
            http,
            dns,
            health_wait: config.supervision.health_wait(),
            graceful_timeout,
            pid_file: config.supervision.pid_file.clone(),
        })
    }
}

/// Build the horizons named in `config`, in order.
///
/// `decorate` attaches handlers to each horizon; horizons left alone
/// answer 403 and refuse queries.
pub fn router_from_config(
    config: &EdgeConfig,
    mut decorate: impl FnMut(Horizon) -> Horizon,
) -> EdgeResult<HorizonRouter> {
    let timeout = match config.dns.exchange_timeout() {
        Some(d) => ExchangeTimeout::Fixed(d),
        None => ExchangeTimeout::None,
    };
    let mut router = HorizonRouter::new().with_exchange_timeout(timeout);

    for h in &config.horizons {
        let ranges = h
            .ranges
            .iter()
            .map(|r| {
                r.parse()
                    .map_err(|e| EdgeError::Config(format!("horizon {:?}: range {r:?}: {e}", h.name)))
            })
            .collect::<EdgeResult<Vec<_>>>()?;
        router.append(decorate(Horizon::new(h.name.clone(), ranges)))?;
    }
    Ok(router)
}

/// HTTP and DNS servers behind one horizon router.
pub struct EdgeServer {
    group: WorkerGroup,
    http: Option<HttpServer>,
    dns: Option<DnsServer>,
    health_wait: Duration,
    graceful_timeout: Duration,
    pid_file: Option<PathBuf>,
}

impl EdgeServer {
    pub fn new(options: EdgeOptions) -> Self {
        let group = WorkerGroup::new();
        Self {
            http: options.http.map(|c| HttpServer::new(c, group.child())),
            dns: options.dns.map(|c| DnsServer::new(c, group.child())),
            group,
            health_wait: options.health_wait,
            graceful_timeout: options.graceful_timeout,
            pid_file: options.pid_file,
        }
    }

    pub fn http(&self) -> Option<&HttpServer> {
        self.http.as_ref()
    }

    pub fn dns(&self) -> Option<&DnsServer> {
        self.dns.as_ref()
    }

    /// Bind every listener with fresh sockets.
    pub fn listen(&self) -> EdgeResult<()> {
        self.listen_with_provider(Arc::new(PlainSockets))
    }

    /// Bind every listener through `provider`.
    pub fn listen_with_provider(&self, provider: Arc<dyn SocketProvider>) -> EdgeResult<()> {
        if self.http.is_none() && self.dns.is_none() {
            return Err(EdgeError::NotListening);
        }
        let binder = Binder::new(provider);

        if let Some(http) = &self.http {
            http.listen(&binder)?;
        }
        if let Some(dns) = &self.dns {
            if let Err(err) = dns.listen(&binder) {
                if let Some(http) = &self.http {
                    let _ = http.close();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Bound addresses by protocol.
    pub fn addrs(&self) -> Vec<(&'static str, std::net::SocketAddr)> {
        let mut addrs = self.http.as_ref().map(HttpServer::addrs).unwrap_or_default();
        addrs.extend(self.dns.as_ref().map(DnsServer::addrs).unwrap_or_default());
        addrs
    }

    /// Serve every bound listener through `router`.
    ///
    /// Blocks up to the configured health wait so that listeners failing
    /// at start-up are reported here.
    pub async fn spawn(&self, router: Arc<HorizonRouter>) -> EdgeResult<()> {
        if self.http.is_none() && self.dns.is_none() {
            return Err(EdgeError::NotListening);
        }

        if let Some(http) = &self.http {
            if let Err(err) = http.spawn(router.clone().into_http(), Duration::ZERO).await {
                self.group.cancel(err.clone());
                return Err(err);
            }
        }
        if let Some(dns) = &self.dns {
            if let Err(err) = dns.spawn(router, Duration::ZERO).await {
                self.group.cancel(err.clone());
                return Err(err);
            }
        }

        self.group.settle(self.health_wait).await
    }

    /// Spawn, then wait for every listener.
    pub async fn serve(&self, router: Arc<HorizonRouter>) -> EdgeResult<()> {
        self.spawn(router).await?;
        self.wait().await
    }

    /// Cancel every listener and wait up to `timeout` for them to stop.
    ///
    /// A zero `timeout` waits without bound. Past the timeout
    /// `ShutdownTimedOut` is returned while listeners keep draining.
    pub async fn shutdown(&self, timeout: Duration) -> EdgeResult<()> {
        let closed = self.close();
        let stopped = if timeout.is_zero() {
            self.wait().await
        } else {
            tokio::select! {
                res = self.wait() => res,
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(timeout = ?timeout, running = self.group.running(), "Graceful shutdown timed out");
                    Err(EdgeError::ShutdownTimedOut(timeout))
                }
            }
        };
        stopped.and(closed)
    }

    /// Cancel with `cause`. Only the first cause is kept.
    pub fn cancel(&self, cause: EdgeError) {
        self.group.cancel(cause);
    }

    /// Cancel because of a failure outside the listeners.
    pub fn fail(&self, cause: EdgeError) {
        tracing::error!(error = %cause, "Edge server failed");
        self.group.cancel(cause);
    }

    /// The cancellation cause, `Closed` when cancelled without one.
    pub fn err(&self) -> Option<EdgeError> {
        match self.group.err() {
            Some(err) => Some(err),
            None if self.group.is_cancelled() => Some(EdgeError::Closed),
            None => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.group.is_cancelled()
    }

    /// Wait for every listener; benign shutdown causes are reported as
    /// success.
    pub async fn wait(&self) -> EdgeResult<()> {
        let res = self.group.wait().await;
        // every task has returned; record the servers as stopped
        if let Some(http) = &self.http {
            let _ = http.wait().await;
        }
        if let Some(dns) = &self.dns {
            let _ = dns.wait().await;
        }
        res
    }

    /// Cancel, and close every socket not yet handed to a listener.
    ///
    /// Idempotent.
    pub fn close(&self) -> EdgeResult<()> {
        self.group.cancel(EdgeError::Cancelled);

        let mut errs = Vec::new();
        let results = [
            self.http.as_ref().map(HttpServer::close),
            self.dns.as_ref().map(DnsServer::close),
        ];
        for res in results.into_iter().flatten() {
            match res {
                Ok(()) => {}
                Err(EdgeError::Close(e)) => errs.extend(e),
                Err(other) => return Err(other),
            }
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(EdgeError::Close(errs))
        }
    }

    /// Run as a supervised process until terminated or replaced.
    ///
    /// Listeners are acquired through the hot-handoff [`Upgrader`], which
    /// also tells a predecessor that this generation is ready. SIGHUP
    /// reloads through `reloader` when given, otherwise hands off like
    /// SIGUSR2.
    ///
    /// [`Upgrader`]: crate::net::Upgrader
    #[cfg(unix)]
    pub async fn listen_and_serve(&self, router: Arc<HorizonRouter>, reloader: Option<&dyn Reloader>) -> EdgeResult<()> {
        use crate::net::upgrade::Upgrader;

        let upgrader = Arc::new(Upgrader::from_env(self.pid_file.clone())?);
        self.listen_with_provider(upgrader.clone())?;
        if let Err(err) = self.spawn(router).await {
            let _ = self.close();
            return Err(err);
        }
        upgrader.ready()?;
        tracing::info!(addrs = ?self.addrs(), "Edge server ready");

        let mut signals = crate::lifecycle::signals::watch_signals()?;
        loop {
            tokio::select! {
                _ = self.group.cancelled() => break,
                _ = upgrader.exit() => break,
                event = signals.recv() => match event {
                    None | Some(SignalEvent::Terminate) => break,
                    Some(SignalEvent::Reload) => match reloader {
                        Some(reloader) => match reloader.reload() {
                            Ok(()) => tracing::info!("Reloaded"),
                            Err(err) => tracing::error!(error = %err, "Reload failed"),
                        },
                        None => handoff(&upgrader).await,
                    },
                    Some(SignalEvent::Upgrade) => handoff(&upgrader).await,
                },
            }
        }

        tracing::info!("Shutting down edge server");
        self.shutdown(self.graceful_timeout).await
    }

    /// Run until interrupted.
    #[cfg(not(unix))]
    pub async fn listen_and_serve(&self, router: Arc<HorizonRouter>, _reloader: Option<&dyn Reloader>) -> EdgeResult<()> {
        self.listen()?;
        if let Err(err) = self.spawn(router).await {
            let _ = self.close();
            return Err(err);
        }
        if let Some(path) = &self.pid_file {
            std::fs::write(path, format!("{}\n", std::process::id()))?;
        }

        let mut signals = crate::lifecycle::signals::watch_signals()?;
        tokio::select! {
            _ = self.group.cancelled() => {}
            _ = signals.recv() => {}
        }
        self.shutdown(self.graceful_timeout).await
    }
}

#[cfg(unix)]
async fn handoff(upgrader: &crate::net::upgrade::Upgrader) {
    tracing::info!("Handing off to a new process generation");
    if let Err(err) = upgrader.upgrade().await {
        tracing::error!(error = %err, "Handoff failed, still serving");
    }
}

impl std::fmt::Debug for EdgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeServer")
            .field("group", &self.group)
            .field("http", &self.http.is_some())
            .field("dns", &self.dns.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Instant;

    #[tokio::test]
    async fn nothing_configured_is_not_listening() {
        let srv = EdgeServer::new(EdgeOptions::default());
        assert_eq!(srv.listen().unwrap_err().kind(), ErrorKind::NotListening);
        let err = srv.spawn(Arc::new(HorizonRouter::new())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotListening);
    }

    #[tokio::test]
    async fn shutdown_timeout_is_soft() {
        let srv = EdgeServer::new(EdgeOptions::default());
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        srv.group.go(|_| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = done_tx.send(());
            Ok(())
        });

        let err = srv.shutdown(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShutdownTimedOut);

        // the task was not killed
        done_rx.await.unwrap();
        srv.wait().await.unwrap();
    }

    #[tokio::test]
    async fn zero_timeout_waits_for_every_task() {
        let srv = EdgeServer::new(EdgeOptions::default());
        srv.group.go(|_| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        });

        let start = Instant::now();
        srv.shutdown(Duration::ZERO).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(srv.group.running(), 0);
    }

    #[tokio::test]
    async fn err_reports_first_cause() {
        let srv = EdgeServer::new(EdgeOptions::default());
        assert!(srv.err().is_none());
        assert!(!srv.is_cancelled());

        srv.fail(EdgeError::Worker("disk full".into()));
        srv.cancel(EdgeError::Cancelled);
        assert!(srv.is_cancelled());
        assert_eq!(srv.err().unwrap().to_string(), "worker failed: disk full");
        assert!(srv.wait().await.is_err());
    }

    #[tokio::test]
    async fn cancelling_one_server_keeps_its_own_cause() {
        use crate::lifecycle::ServerState;
        use std::net::{IpAddr, Ipv4Addr};

        let localhost = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        let srv = EdgeServer::new(EdgeOptions {
            http: Some(HttpConfig {
                addresses: localhost.clone(),
                port: Some(0),
                insecure_port: Some(0),
                port_attempts: 1,
                enable_insecure: true,
                allow_insecure: true,
                graceful_timeout: Duration::from_secs(1),
                ..HttpConfig::default()
            }),
            dns: Some(DnsConfig {
                addresses: localhost,
                port: Some(0),
                port_attempts: 1,
                graceful_timeout: Duration::from_secs(1),
                ..DnsConfig::default()
            }),
            ..EdgeOptions::default()
        });
        srv.listen().unwrap();
        srv.spawn(Arc::new(HorizonRouter::new())).await.unwrap();

        let dns = srv.dns().unwrap();
        let http = srv.http().unwrap();
        dns.cancel(EdgeError::Worker("dns maintenance".into()));
        let res = tokio::time::timeout(Duration::from_secs(3), dns.wait()).await.unwrap();
        assert_eq!(res.unwrap_err().to_string(), "worker failed: dns maintenance");
        assert_eq!(dns.err().unwrap().to_string(), "worker failed: dns maintenance");
        assert_eq!(dns.state(), ServerState::Stopped);

        assert!(http.err().is_none());
        assert!(!srv.is_cancelled());
        assert_eq!(http.state(), ServerState::Serving);

        srv.shutdown(Duration::from_secs(3)).await.unwrap();
        assert_eq!(http.err().unwrap().kind(), ErrorKind::Cancelled);
        assert_eq!(http.state(), ServerState::Stopped);
        assert_eq!(dns.err().unwrap().to_string(), "worker failed: dns maintenance");
    }

    #[tokio::test]
    async fn listener_failure_cancels_the_edge() {
        let srv = EdgeServer::new(EdgeOptions::default());
        let dns = srv.group.child();
        dns.go(|_| async move { Err(EdgeError::Worker("udp socket lost".into())) });

        let res = tokio::time::timeout(Duration::from_secs(2), srv.wait()).await.unwrap();
        assert_eq!(res.unwrap_err().to_string(), "worker failed: udp socket lost");
        assert_eq!(srv.err().unwrap().to_string(), "worker failed: udp socket lost");
    }

    #[test]
    fn router_from_config_keeps_order() {
        let config: EdgeConfig = toml::from_str(
            r#"
            name = "edge"
            [[horizons]]
            name = "lan"
            ranges = ["10.0.0.0/8"]
            [[horizons]]
            name = "world"
            "#,
        )
        .unwrap();
        let router = router_from_config(&config, |h| h).unwrap();
        let (h, _) = router.match_addr("10.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(h.name(), "lan");
        let (h, _) = router.match_addr("192.0.2.1".parse().unwrap()).unwrap();
        assert_eq!(h.name(), "world");
    }

    #[test]
    fn options_without_tls_or_insecure_skip_http() {
        let mut config = EdgeConfig {
            name: "edge".into(),
            ..EdgeConfig::default()
        };
        config.dns.enabled = true;
        let opts = EdgeOptions::from_config(&config).unwrap();
        assert!(opts.http.is_none());
        let dns = opts.dns.unwrap();
        assert_eq!(dns.port, Some(53));
        assert!(dns.tls.is_none());
    }
}
