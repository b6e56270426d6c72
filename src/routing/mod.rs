//! Split-horizon routing.
//!
//! # Data Flow
//! ```text
//! HTTP request (ConnectInfo) ─┐
//!                             ├─→ horizon.rs (first horizon containing the address)
//! DNS query (writer remote) ──┘       → http.rs: horizon app, Match as extension
//!                                     → dns.rs: horizon exchanger, Match in context
//! no horizon → 403 `forbidden` / REFUSED
//! ```
//!
//! # Design Decisions
//! - Horizons are appended at startup and read-only while serving
//! - Unmatched traffic gets a deterministic reply, never a dropped connection

pub mod dns;
pub mod horizon;
pub mod http;

pub use dns::{ExchangeTimeout, Refuse};
pub use horizon::{Horizon, HorizonRouter, Match};
