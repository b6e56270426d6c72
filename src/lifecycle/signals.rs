//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGHUP, SIGUSR2, SIGINT, SIGTERM)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP prefers an in-place reload, falling back to a handoff
//! - SIGUSR2 always hands off to a new process generation

use tokio::sync::mpsc;

/// What the process was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Reload in place if supported, else hand off (SIGHUP).
    Reload,
    /// Hand off to a new generation unconditionally (SIGUSR2).
    Upgrade,
    /// Shut down (SIGINT, SIGTERM).
    Terminate,
}

/// Capability of an application to reload itself without a restart.
pub trait Reloader: Send + Sync {
    /// Reload configuration or state in place.
    fn reload(&self) -> Result<(), crate::EdgeError>;
}

/// Install the handlers and forward events until the receiver is dropped.
#[cfg(unix)]
pub fn watch_signals() -> std::io::Result<mpsc::UnboundedReceiver<SignalEvent>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = signal(SignalKind::hangup())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = hup.recv() => SignalEvent::Reload,
                Some(()) = usr2.recv() => SignalEvent::Upgrade,
                Some(()) = int.recv() => SignalEvent::Terminate,
                Some(()) = term.recv() => SignalEvent::Terminate,
                else => break,
            };

            tracing::debug!(?event, "Signal received");
            if tx.send(event).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Install the handlers and forward events until the receiver is dropped.
#[cfg(not(unix))]
pub fn watch_signals() -> std::io::Result<mpsc::UnboundedReceiver<SignalEvent>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(SignalEvent::Terminate).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}
