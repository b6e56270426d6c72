//! Accept-side helpers shared by the HTTP and DNS stream listeners.
//!
//! # Responsibilities
//! - Convert bound std sockets into Tokio listeners
//! - Run bounded TLS handshakes on accepted streams
//! - Apply per-connection socket options (keep-alive, no-delay)
//! - Classify accept errors as transient or fatal

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Pause after a transient accept failure.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Hand a bound std listener to Tokio.
pub fn tokio_tcp(listener: std::net::TcpListener) -> io::Result<TcpListener> {
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// Hand a bound std UDP socket to Tokio.
pub fn tokio_udp(socket: std::net::UdpSocket) -> io::Result<tokio::net::UdpSocket> {
    socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(socket)
}

/// Socket options for an accepted stream.
pub fn configure_stream(stream: &TcpStream, keep_alive: Option<Duration>) {
    let _ = stream.set_nodelay(true);
    if let Some(period) = keep_alive.filter(|d| !d.is_zero()) {
        let params = TcpKeepalive::new().with_time(period);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&params) {
            tracing::debug!(error = %e, "Failed to set keep-alive");
        }
    }
}

/// Accept errors that do not mean the listener is gone.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || is_fd_exhaustion(err)
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(code) if code == nix::libc::EMFILE || code == nix::libc::ENFILE
        )
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Run a server TLS handshake, bounded by `timeout` unless it is zero.
pub async fn tls_handshake(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> io::Result<TlsStream<TcpStream>> {
    if timeout.is_zero() {
        return acceptor.accept(stream).await;
    }
    tokio::time::timeout(timeout, acceptor.accept(stream))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
}
