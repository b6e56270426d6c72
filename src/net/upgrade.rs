//! Zero-downtime handoff of listening sockets to a successor process.
//!
//! # Responsibilities
//! - Adopt sockets inherited from a predecessor generation
//! - Re-exec the running binary, passing every socket handed out so far
//! - Tell the predecessor when this generation is ready for service
//!
//! # Data Flow
//! ```text
//! parent: upgrade()
//!     → dup'd listener fds + readiness socket, FD_CLOEXEC cleared in child
//!     → EDGY_UPGRADE_FDS="tcp@127.0.0.1:443=5;udp@127.0.0.1:53=6"
//!     → EDGY_UPGRADE_READY_FD=7
//! child: from_env() adopts fds → listen_* reuses them → ready() writes 1 byte
//! parent: readiness byte received → exit() resolves → graceful shutdown
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::error::{EdgeError, EdgeResult};
use crate::net::provider::{PlainSockets, SocketProvider};

/// Inherited listener fds, `kind@addr=fd` joined by `;`.
pub const ENV_FDS: &str = "EDGY_UPGRADE_FDS";

/// Fd the successor writes one byte to once ready.
pub const ENV_READY: &str = "EDGY_UPGRADE_READY_FD";

/// How long a successor gets to become ready.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// Socket provider that survives process upgrades.
pub struct Upgrader {
    inherited: Mutex<HashMap<String, OwnedFd>>,
    handed_out: Mutex<Vec<(String, OwnedFd)>>,
    ready_fd: Mutex<Option<OwnedFd>>,
    pid_file: Option<PathBuf>,
    upgrading: AtomicBool,
    exit: watch::Sender<bool>,
}

impl Upgrader {
    /// Build from the environment left by a predecessor, if any.
    pub fn from_env(pid_file: Option<PathBuf>) -> EdgeResult<Self> {
        let inherited = match std::env::var(ENV_FDS) {
            Ok(spec) => parse_fds(&spec)?,
            Err(_) => HashMap::new(),
        };
        let ready_fd = match std::env::var(ENV_READY) {
            Ok(raw) => Some(adopt_fd(&raw)?),
            Err(_) => None,
        };

        if !inherited.is_empty() {
            tracing::info!(count = inherited.len(), "Inherited listeners from predecessor");
        }

        let (exit, _) = watch::channel(false);
        Ok(Self {
            inherited: Mutex::new(inherited),
            handed_out: Mutex::new(Vec::new()),
            ready_fd: Mutex::new(ready_fd),
            pid_file,
            upgrading: AtomicBool::new(false),
            exit,
        })
    }

    /// Tell if this process was started by a predecessor.
    pub fn has_parent(&self) -> bool {
        lock(&self.ready_fd).is_some()
    }

    fn take_inherited(&self, key: &str) -> Option<OwnedFd> {
        lock(&self.inherited).remove(key)
    }

    fn remember(&self, key: String, fd: OwnedFd) {
        lock(&self.handed_out).push((key, fd));
    }

    /// Mark this generation ready: write the PID file, notify the
    /// predecessor, and close inherited sockets nobody asked for.
    pub fn ready(&self) -> EdgeResult<()> {
        if let Some(path) = &self.pid_file {
            std::fs::write(path, format!("{}\n", std::process::id()))?;
        }

        let unused: Vec<_> = lock(&self.inherited).drain().collect();
        for (key, _) in &unused {
            tracing::debug!(listener = %key, "Closing unused inherited listener");
        }
        drop(unused);

        if let Some(fd) = lock(&self.ready_fd).take() {
            File::from(fd).write_all(b"1")?;
            tracing::info!("Notified predecessor");
        }
        Ok(())
    }

    /// Start a successor and wait for it to become ready.
    ///
    /// On success [`Upgrader::exit`] resolves and this generation should
    /// drain and stop.
    pub async fn upgrade(&self) -> EdgeResult<()> {
        if self.upgrading.swap(true, Ordering::SeqCst) {
            return Err(EdgeError::Invariant("upgrade already in progress".into()));
        }
        let res = self.spawn_successor().await;
        self.upgrading.store(false, Ordering::SeqCst);

        if res.is_ok() {
            tracing::info!("Successor ready, handing over");
            self.stop();
        }
        res
    }

    async fn spawn_successor(&self) -> EdgeResult<()> {
        let exe = std::env::current_exe()?;
        let (parent_end, child_end) = UnixStream::pair()?;

        let (fds_env, mut pass) = {
            let handed = lock(&self.handed_out);
            let env = handed
                .iter()
                .map(|(key, fd)| format!("{key}={}", fd.as_raw_fd()))
                .collect::<Vec<_>>()
                .join(";");
            let fds: Vec<RawFd> = handed.iter().map(|(_, fd)| fd.as_raw_fd()).collect();
            (env, fds)
        };
        pass.push(child_end.as_raw_fd());

        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(std::env::args_os().skip(1))
            .env(ENV_FDS, fds_env)
            .env(ENV_READY, child_end.as_raw_fd().to_string());
        // SAFETY: only async-signal-safe fcntl calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                for fd in &pass {
                    fcntl(*fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        drop(child_end);
        tracing::info!(pid = ?child.id(), "Started successor");

        parent_end.set_nonblocking(true)?;
        let mut ready = tokio::net::UnixStream::from_std(parent_end)?;
        let mut buf = [0u8; 1];

        tokio::select! {
            res = tokio::time::timeout(UPGRADE_TIMEOUT, ready.read(&mut buf)) => match res {
                Ok(Ok(1)) => Ok(()),
                Ok(Ok(_)) => Err(EdgeError::Worker("successor exited before becoming ready".into())),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => {
                    let _ = child.start_kill();
                    Err(EdgeError::Worker("successor did not become ready in time".into()))
                }
            },
            status = child.wait() => Err(EdgeError::Worker(format!("successor exited: {}", status?))),
        }
    }

    /// Request this generation to stop.
    pub fn stop(&self) {
        self.exit.send_replace(true);
    }

    /// Resolves once a successor took over or [`Upgrader::stop`] was called.
    pub async fn exit(&self) {
        let mut rx = self.exit.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl SocketProvider for Upgrader {
    fn listen_tcp(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = match self.take_inherited(&key("tcp", addr)) {
            Some(fd) => {
                let listener = TcpListener::from(fd);
                listener.set_nonblocking(true)?;
                listener
            }
            None => PlainSockets.listen_tcp(addr)?,
        };
        let local = listener.local_addr()?;
        self.remember(key("tcp", local), OwnedFd::from(listener.try_clone()?));
        Ok(listener)
    }

    fn listen_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = match self.take_inherited(&key("udp", addr)) {
            Some(fd) => {
                let socket = UdpSocket::from(fd);
                socket.set_nonblocking(true)?;
                socket
            }
            None => PlainSockets.listen_udp(addr)?,
        };
        let local = socket.local_addr()?;
        self.remember(key("udp", local), OwnedFd::from(socket.try_clone()?));
        Ok(socket)
    }
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("inherited", &lock(&self.inherited).len())
            .field("handed_out", &lock(&self.handed_out).len())
            .field("pid_file", &self.pid_file)
            .finish_non_exhaustive()
    }
}

fn key(kind: &str, addr: SocketAddr) -> String {
    format!("{kind}@{addr}")
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_fds(spec: &str) -> EdgeResult<HashMap<String, OwnedFd>> {
    let mut fds = HashMap::new();
    for entry in spec.split(';').filter(|s| !s.is_empty()) {
        let (name, raw) = entry
            .rsplit_once('=')
            .ok_or_else(|| EdgeError::Config(format!("{ENV_FDS}: malformed entry {entry:?}")))?;
        let (kind, addr) = name
            .split_once('@')
            .ok_or_else(|| EdgeError::Config(format!("{ENV_FDS}: malformed name {name:?}")))?;
        if kind != "tcp" && kind != "udp" {
            return Err(EdgeError::Config(format!("{ENV_FDS}: unknown kind {kind:?}")));
        }
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| EdgeError::Config(format!("{ENV_FDS}: bad address {addr:?}")))?;
        fds.insert(key(kind, addr), adopt_fd(raw)?);
    }
    Ok(fds)
}

/// Take ownership of an inherited fd, after checking it is open.
fn adopt_fd(raw: &str) -> EdgeResult<OwnedFd> {
    let fd: RawFd = raw
        .trim()
        .parse()
        .map_err(|_| EdgeError::Config(format!("bad inherited fd {raw:?}")))?;
    if fd < 3 {
        return Err(EdgeError::Config(format!("refusing to adopt fd {fd}")));
    }
    fcntl(fd, FcntlArg::F_GETFD).map_err(|e| EdgeError::Config(format!("inherited fd {fd}: {e}")))?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    // SAFETY: the fd is open and was handed to this process exclusively.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Upgrader {
        let (exit, _) = watch::channel(false);
        Upgrader {
            inherited: Mutex::new(HashMap::new()),
            handed_out: Mutex::new(Vec::new()),
            ready_fd: Mutex::new(None),
            pid_file: None,
            upgrading: AtomicBool::new(false),
            exit,
        }
    }

    #[test]
    fn handed_out_sockets_are_remembered() {
        let upg = fresh();
        let tcp = upg.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = tcp.local_addr().unwrap().port();
        upg.listen_udp(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();

        let handed = lock(&upg.handed_out);
        assert_eq!(handed.len(), 2);
        assert_eq!(handed[0].0, format!("tcp@127.0.0.1:{port}"));
        assert_eq!(handed[1].0, format!("udp@127.0.0.1:{port}"));
    }

    #[test]
    fn inherited_socket_is_reused() {
        let original = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();

        let upg = fresh();
        lock(&upg.inherited).insert(key("tcp", addr), OwnedFd::from(original));

        // the port is still held, so only adoption can succeed
        let adopted = upg.listen_tcp(addr).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);
        assert!(lock(&upg.inherited).is_empty());
    }

    #[test]
    fn malformed_env_is_config_error() {
        assert!(matches!(parse_fds("tcp@127.0.0.1:80"), Err(EdgeError::Config(_))));
        assert!(matches!(parse_fds("sctp@127.0.0.1:80=9"), Err(EdgeError::Config(_))));
        assert!(matches!(parse_fds("tcp@nowhere=9"), Err(EdgeError::Config(_))));
        assert!(parse_fds("").unwrap().is_empty());
    }

    #[test]
    fn ready_writes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgy.pid");
        let mut upg = fresh();
        upg.pid_file = Some(path.clone());

        upg.ready().unwrap();
        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[tokio::test]
    async fn stop_resolves_exit() {
        let upg = fresh();
        upg.stop();
        tokio::time::timeout(Duration::from_secs(1), upg.exit())
            .await
            .unwrap();
    }
}
