//! Error taxonomy shared by every subsystem.
//!
//! # Design Decisions
//! - One `Clone` error type: a recorded cancellation cause is observed by
//!   many waiters, so io errors are held behind `Arc`
//! - Classification is explicit: every variant maps to an [`ErrorKind`]
//!   chosen at construction time
//! - Shutdown noise (`Cancelled`, `Closed`) is benign and filtered before
//!   reaching external callers

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::ResponseCode;
use thiserror::Error;

/// Coarse classification of an [`EdgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Address or port unavailable.
    Bind,
    /// Re-entrant spawn on a serving instance.
    AlreadyRunning,
    /// Serve invoked before listeners were bound.
    NotListening,
    /// Graceful window elapsed before all tasks finished.
    ShutdownTimedOut,
    /// Terminal error of a worker task.
    WorkerFailure,
    /// Per-request or per-query failure.
    Protocol,
    /// Duplicate name.
    Conflict,
    /// Invalid configuration.
    Config,
    /// TLS setup failure.
    Tls,
    /// Broken internal invariant.
    Invariant,
    /// Intentional cancellation.
    Cancelled,
    /// Listener closed by an intentional shutdown.
    Closed,
    /// Any other I/O failure.
    Io,
}

/// Errors produced by the edge server engine.
#[derive(Debug, Clone, Error)]
pub enum EdgeError {
    /// No port in the attempted range could be bound.
    #[error("bind {addr}: ports {first}-{last} unavailable: {source}")]
    Bind {
        addr: IpAddr,
        first: u16,
        last: u16,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("server already running")]
    AlreadyRunning,

    #[error("no listeners available")]
    NotListening,

    #[error("graceful shutdown timed out after {0:?}")]
    ShutdownTimedOut(Duration),

    /// A listener's serve loop failed.
    #[error("{proto} listener on {addr} failed: {source}")]
    Listener {
        proto: &'static str,
        addr: SocketAddr,
        #[source]
        source: Arc<io::Error>,
    },

    /// A worker panicked or reported a failure without an io error.
    #[error("worker failed: {0}")]
    Worker(String),

    /// A DNS exchange failed; `rcode` is the code to answer with.
    #[error("dns exchange failed ({rcode}): {message}")]
    Exchange { rcode: ResponseCode, message: String },

    #[error("horizon {0:?} already exists")]
    HorizonExists(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("listener closed")]
    Closed,

    /// Closing a listener set failed for one or more sockets.
    #[error("failed to close {} socket(s): {}", .0.len(), join_errors(.0))]
    Close(Vec<Arc<io::Error>>),

    #[error("io: {0}")]
    Io(Arc<io::Error>),
}

fn join_errors(errs: &[Arc<io::Error>]) -> String {
    errs.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl EdgeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EdgeError::Bind { .. } => ErrorKind::Bind,
            EdgeError::AlreadyRunning => ErrorKind::AlreadyRunning,
            EdgeError::NotListening => ErrorKind::NotListening,
            EdgeError::ShutdownTimedOut(_) => ErrorKind::ShutdownTimedOut,
            EdgeError::Listener { .. } | EdgeError::Worker(_) => ErrorKind::WorkerFailure,
            EdgeError::Exchange { .. } => ErrorKind::Protocol,
            EdgeError::HorizonExists(_) => ErrorKind::Conflict,
            EdgeError::Config(_) => ErrorKind::Config,
            EdgeError::Tls(_) => ErrorKind::Tls,
            EdgeError::Invariant(_) => ErrorKind::Invariant,
            EdgeError::Cancelled => ErrorKind::Cancelled,
            EdgeError::Closed => ErrorKind::Closed,
            EdgeError::Close(_) | EdgeError::Io(_) => ErrorKind::Io,
        }
    }

    /// True for errors produced purely by an intentional shutdown.
    pub fn is_benign(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::Closed)
    }

    /// Wrap a serve loop failure of one listener.
    pub fn listener(proto: &'static str, addr: SocketAddr, source: io::Error) -> Self {
        EdgeError::Listener {
            proto,
            addr,
            source: Arc::new(source),
        }
    }

    /// Build an exchange failure answered with `rcode`.
    pub fn exchange(rcode: ResponseCode, message: impl Into<String>) -> Self {
        EdgeError::Exchange {
            rcode,
            message: message.into(),
        }
    }
}

impl From<io::Error> for EdgeError {
    fn from(err: io::Error) -> Self {
        EdgeError::Io(Arc::new(err))
    }
}

impl From<rustls::Error> for EdgeError {
    fn from(err: rustls::Error) -> Self {
        EdgeError::Tls(err.to_string())
    }
}

/// Result type for engine operations.
pub type EdgeResult<T> = Result<T, EdgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_errors_are_shutdown_noise() {
        assert!(EdgeError::Cancelled.is_benign());
        assert!(EdgeError::Closed.is_benign());
        assert!(!EdgeError::NotListening.is_benign());
        assert!(!EdgeError::Worker("boom".into()).is_benign());
    }

    #[test]
    fn kinds_are_explicit() {
        let err = EdgeError::listener(
            "h2c",
            "127.0.0.1:80".parse().unwrap(),
            io::Error::new(io::ErrorKind::Other, "accept"),
        );
        assert_eq!(err.kind(), ErrorKind::WorkerFailure);
        assert_eq!(EdgeError::HorizonExists("a".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            EdgeError::exchange(ResponseCode::ServFail, "upstream").kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn close_display_lists_every_error() {
        assert_eq!(EdgeError::Close(Vec::new()).to_string(), "failed to close 0 socket(s): ");

        let errs = vec![
            Arc::new(io::Error::new(io::ErrorKind::Other, "udp")),
            Arc::new(io::Error::new(io::ErrorKind::Other, "tcp")),
        ];
        assert_eq!(EdgeError::Close(errs).to_string(), "failed to close 2 socket(s): udp; tcp");
    }

    #[test]
    fn error_display() {
        let err = EdgeError::Bind {
            addr: "127.0.0.1".parse().unwrap(),
            first: 8080,
            last: 8083,
            source: Arc::new(io::Error::new(io::ErrorKind::AddrInUse, "in use")),
        };
        assert_eq!(
            err.to_string(),
            "bind 127.0.0.1: ports 8080-8083 unavailable: in use"
        );
    }
}
