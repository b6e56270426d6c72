//! HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! server.rs (binds secure TCP+UDP and insecure TCP)
//!     → listeners.rs (h2c / h2 accept loops, hyper auto builder)
//!     → h3.rs (QUIC endpoint, h3 request streams)
//!     → composed app: TraceLayer → timeout → alt_svc.rs → acme.rs → app
//!        (insecure without allow_insecure: app = redirect.rs)
//! ```
//!
//! # Design Decisions
//! - The app is any axum [`Router`](axum::Router); the remote address is
//!   provided as `ConnectInfo<SocketAddr>` on every protocol

pub mod acme;
pub mod alt_svc;
pub mod h3;
pub mod listeners;
pub mod redirect;
pub mod response;
pub mod server;

pub use acme::ACME_CHALLENGE_PREFIX;
pub use alt_svc::AltSvc;
pub use server::{HttpConfig, HttpServer};
