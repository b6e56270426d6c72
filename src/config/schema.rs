//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Every
//! section has defaults so a minimal file only names the server.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration of an edge server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EdgeConfig {
    /// Server name, used in logs and the default app.
    pub name: String,

    /// Process supervision (PID file, timeouts).
    pub supervision: SupervisionConfig,

    /// Addresses shared by every listener.
    pub addresses: AddressConfig,

    /// HTTP, HTTPS and HTTP/3 listeners.
    pub http: HttpServerConfig,

    /// DNS and DNS-over-TLS listeners.
    pub dns: DnsServerConfig,

    /// Certificate files; absent disables HTTPS, HTTP/3 and DoT.
    pub tls: Option<TlsConfig>,

    /// Split-horizon policies, matched in order.
    pub horizons: Vec<HorizonConfig>,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Process supervision.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Written once the server is ready.
    pub pid_file: Option<PathBuf>,

    /// Bound on graceful shutdown in seconds; 0 waits without bound.
    pub graceful_timeout_secs: u64,

    /// Time given to listeners to fail at start-up, in milliseconds.
    pub health_wait_ms: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            graceful_timeout_secs: 5,
            health_wait_ms: 1000,
        }
    }
}

impl SupervisionConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn health_wait(&self) -> Duration {
        Duration::from_millis(self.health_wait_ms)
    }
}

/// Bind addresses and port policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AddressConfig {
    /// Addresses to bind; empty means `0.0.0.0` and `::`.
    pub addresses: Vec<IpAddr>,

    /// TCP keep-alive in seconds; 0 leaves the OS default.
    pub keep_alive_secs: u64,

    /// Fail when a port is busy instead of trying the next ones.
    pub port_strict: bool,

    /// Total ports tried per listener set.
    pub port_attempts: u16,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            keep_alive_secs: 0,
            port_strict: false,
            port_attempts: crate::net::bind::DEFAULT_PORT_ATTEMPTS,
        }
    }
}

impl AddressConfig {
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }
}

/// HTTP listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Secure port (TCP and QUIC); 0 means 443.
    pub port: u16,

    /// Plain port; 0 means 80.
    pub insecure_port: u16,

    /// Listen on the plain port.
    pub enable_insecure: bool,

    /// Serve the app on plain HTTP instead of redirecting.
    pub allow_insecure: bool,

    /// Require client certificates.
    pub mtls_only: bool,

    pub read_header_timeout_secs: u64,

    /// Per-request handling bound in seconds; 0 is none.
    pub write_timeout_secs: u64,

    pub idle_timeout_secs: u64,

    /// Serve HTTP/3 next to HTTPS.
    pub enable_quic: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            insecure_port: 0,
            enable_insecure: false,
            allow_insecure: false,
            mtls_only: false,
            read_header_timeout_secs: 2,
            write_timeout_secs: 0,
            idle_timeout_secs: 30,
            enable_quic: true,
        }
    }
}

impl HttpServerConfig {
    /// Secure port after defaults.
    pub fn effective_port(&self) -> u16 {
        non_zero_or(self.port, crate::http::server::DEFAULT_SECURE_PORT)
    }

    /// Plain port after defaults.
    pub fn effective_insecure_port(&self) -> u16 {
        non_zero_or(self.insecure_port, crate::http::server::DEFAULT_INSECURE_PORT)
    }

    pub fn has_insecure(&self) -> bool {
        self.enable_insecure || self.allow_insecure
    }
}

/// DNS listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsServerConfig {
    pub enabled: bool,

    /// UDP and TCP port; 0 means 53.
    pub port: u16,

    /// DoT port; 0 means 853.
    pub tls_port: u16,

    /// Require client certificates on DoT.
    pub mtls_only: bool,

    /// Queries per TCP connection; negative is unlimited, 0 is 128.
    pub max_tcp_queries: i32,

    pub read_timeout_secs: u64,

    pub idle_timeout_secs: u64,

    /// Bound on each exchange in milliseconds; 0 is none.
    pub exchange_timeout_ms: u64,
}

impl Default for DnsServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 0,
            tls_port: 0,
            mtls_only: false,
            max_tcp_queries: 0,
            read_timeout_secs: 2,
            idle_timeout_secs: 8,
            exchange_timeout_ms: 0,
        }
    }
}

impl DnsServerConfig {
    pub fn effective_port(&self) -> u16 {
        non_zero_or(self.port, crate::dns::server::DEFAULT_PORT)
    }

    pub fn effective_tls_port(&self) -> u16 {
        non_zero_or(self.tls_port, crate::dns::server::DEFAULT_TLS_PORT)
    }

    pub fn exchange_timeout(&self) -> Option<Duration> {
        (self.exchange_timeout_ms > 0).then(|| Duration::from_millis(self.exchange_timeout_ms))
    }
}

/// Certificate files (PEM).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// CA pool for client certificates.
    pub roots: Option<PathBuf>,
}

/// One split-horizon policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HorizonConfig {
    pub name: String,

    /// CIDR ranges; empty matches every address.
    #[serde(default)]
    pub ranges: Vec<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub json_logs: bool,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Prometheus endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

fn non_zero_or(port: u16, default: u16) -> u16 {
    if port == 0 {
        default
    } else {
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: EdgeConfig = toml::from_str(r#"name = "edge""#).unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.http.effective_port(), 443);
        assert_eq!(config.http.effective_insecure_port(), 80);
        assert_eq!(config.dns.effective_port(), 53);
        assert_eq!(config.dns.effective_tls_port(), 853);
        assert_eq!(config.addresses.port_attempts, 4);
        assert_eq!(config.supervision.graceful_timeout(), Duration::from_secs(5));
        assert!(config.tls.is_none());
        assert!(config.horizons.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config: EdgeConfig = toml::from_str(
            r#"
            name = "edge.example.org"

            [addresses]
            addresses = ["127.0.0.1", "::1"]
            keep_alive_secs = 10

            [http]
            port = 8443
            insecure_port = 8080
            enable_insecure = true

            [dns]
            enabled = true
            port = 8053
            max_tcp_queries = -1
            exchange_timeout_ms = 250

            [tls]
            cert = "cert.pem"
            key = "key.pem"

            [[horizons]]
            name = "internal"
            ranges = ["10.0.0.0/8", "fd00::/8"]

            [[horizons]]
            name = "world"
            "#,
        )
        .unwrap();

        assert_eq!(config.addresses.addresses.len(), 2);
        assert_eq!(config.addresses.keep_alive(), Some(Duration::from_secs(10)));
        assert_eq!(config.http.effective_port(), 8443);
        assert!(config.http.has_insecure());
        assert_eq!(config.dns.max_tcp_queries, -1);
        assert_eq!(config.dns.exchange_timeout(), Some(Duration::from_millis(250)));
        assert!(config.tls.unwrap().roots.is_none());
        assert_eq!(config.horizons.len(), 2);
        assert!(config.horizons[1].ranges.is_empty());
    }
}
