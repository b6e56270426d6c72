//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! BindConfig
//!     → bind.rs (port retry, shared port across addresses)
//!     → provider.rs / upgrade.rs (fresh or inherited sockets)
//!     → listener.rs (Tokio conversion, TLS wrapping, socket options)
//!     → connection.rs (drain tracking)
//!     → Hand off to HTTP or DNS layer
//! ```
//!
//! # Design Decisions
//! - Sockets travel as std types until a serving loop owns them, so they
//!   can be passed to a successor process untouched
//! - TLS config comes from a certificate store, never from the binder

pub mod bind;
pub mod connection;
pub mod listener;
pub mod provider;
pub mod tls;
#[cfg(unix)]
pub mod upgrade;

pub use bind::{BindConfig, Binder, BoundSockets};
pub use provider::{PlainSockets, SocketProvider};
pub use tls::{CertificateStore, FileStore};
#[cfg(unix)]
pub use upgrade::Upgrader;
