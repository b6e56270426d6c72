//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Workers (group.rs):
//!     go(task, hook) → task runs → failure becomes the shared cause
//!     cancel(cause) → hooks unblock tasks → wait() returns filtered cause
//!
//! Server state (state.rs):
//!     Unbound → Bound → Serving → ShuttingDown → Stopped
//!
//! Signals (signals.rs):
//!     SIGHUP → reload (or handoff)
//!     SIGUSR2 → handoff to a new process generation
//!     SIGTERM/SIGINT → graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One cancellation cause per group, first writer wins
//! - "Cancelled" and "stopped" are separately observable
//! - Shutdown never force-kills tasks past its timeout

pub mod group;
pub mod signals;
pub mod state;

pub use group::{WorkerContext, WorkerGroup};
pub use signals::{Reloader, SignalEvent};
pub use state::ServerState;
