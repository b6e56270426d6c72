//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EdgeConfig (validated, immutable)
//!     → edge.rs builds server options and horizons from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a reload or handoff
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AddressConfig, DnsServerConfig, EdgeConfig, HorizonConfig, HttpServerConfig, ObservabilityConfig,
    SupervisionConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
