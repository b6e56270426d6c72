//! DNS subsystem.
//!
//! # Data Flow
//! ```text
//! server.rs (binds 53/udp+tcp, 853/tcp)
//!     → listener.rs (one serve loop per socket)
//!     → handler.rs (DnsHandler, usually the horizon router)
//!     → writer.rs (reply capture, encoding, truncation)
//! ```

pub mod handler;
pub mod listener;
pub mod server;
pub mod writer;

pub use handler::{DnsHandler, ExchangeContext, Exchanger};
pub use listener::QueryLimits;
pub use server::{DnsConfig, DnsServer};
pub use writer::{DnsProto, DnsResponseWriter};
