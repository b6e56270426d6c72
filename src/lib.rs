//! Edge server runtime.
//!
//! Serves HTTP (h2c, h2, h3) and DNS (UDP, TCP, DoT) from one process,
//! routing every request to a *horizon* chosen by the client's address,
//! and hands its listening sockets to a new process generation on
//! upgrade without dropping connections.

pub mod config;
pub mod dns;
pub mod edge;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;

pub use config::schema::EdgeConfig;
pub use edge::{EdgeOptions, EdgeServer};
pub use error::{EdgeError, EdgeResult, ErrorKind};
pub use lifecycle::WorkerGroup;
pub use routing::{Horizon, HorizonRouter, Match};
