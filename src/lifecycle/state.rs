//! Protocol server lifecycle.
//!
//! # Design Decisions
//! - Transitions are one-way: Unbound → Bound → Serving → ShuttingDown → Stopped
//! - Spawning twice is `AlreadyRunning`; spawning before binding is `NotListening`

use crate::error::{EdgeError, EdgeResult};

/// Lifecycle state of a protocol server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// No listeners acquired yet.
    Unbound,
    /// Listeners acquired, not serving.
    Bound,
    /// Listener tasks spawned.
    Serving,
    /// Cancellation requested, tasks draining.
    ShuttingDown,
    /// Every task has returned.
    Stopped,
}

impl ServerState {
    /// Move to `Bound` after listeners were acquired.
    pub fn bind(&mut self) -> EdgeResult<()> {
        match self {
            ServerState::Unbound => {
                *self = ServerState::Bound;
                Ok(())
            }
            _ => Err(EdgeError::AlreadyRunning),
        }
    }

    /// Move to `Serving`, guarding against double spawn.
    pub fn serve(&mut self) -> EdgeResult<()> {
        match self {
            ServerState::Unbound => Err(EdgeError::NotListening),
            ServerState::Bound => {
                *self = ServerState::Serving;
                Ok(())
            }
            _ => Err(EdgeError::AlreadyRunning),
        }
    }

    /// Record that shutdown has begun. Never moves backwards.
    pub fn shutting_down(&mut self) {
        if *self < ServerState::ShuttingDown {
            *self = ServerState::ShuttingDown;
        }
    }

    /// Record that every task has returned.
    pub fn stopped(&mut self) {
        *self = ServerState::Stopped;
    }

    /// Tell if listener tasks were spawned at some point.
    pub fn has_started(&self) -> bool {
        *self >= ServerState::Serving
    }
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState::Unbound
    }
}
