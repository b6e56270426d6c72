//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Detect conflicting ports and duplicate horizons
//! - Check that `mtls_only` has a CA pool to verify against
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EdgeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use ipnet::IpNet;

use crate::config::schema::EdgeConfig;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check `config`, collecting every violation.
pub fn validate_config(config: &EdgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.name.trim().is_empty() {
        errors.push(ValidationError::new("name", "must not be empty"));
    }

    if config.addresses.port_attempts == 0 {
        errors.push(ValidationError::new("addresses.port_attempts", "must be at least 1"));
    }

    let http = &config.http;
    if config.tls.is_some()
        && http.has_insecure()
        && http.effective_port() == http.effective_insecure_port()
    {
        errors.push(ValidationError::new(
            "http.insecure_port",
            format!("conflicts with http.port ({})", http.effective_port()),
        ));
    }

    let dns = &config.dns;
    if dns.enabled && config.tls.is_some() && dns.effective_port() == dns.effective_tls_port() {
        errors.push(ValidationError::new(
            "dns.tls_port",
            format!("conflicts with dns.port ({})", dns.effective_port()),
        ));
    }

    let has_roots = config.tls.as_ref().is_some_and(|tls| tls.roots.is_some());
    if http.mtls_only && !has_roots {
        errors.push(ValidationError::new("http.mtls_only", "requires tls.roots"));
    }
    if dns.mtls_only && !has_roots {
        errors.push(ValidationError::new("dns.mtls_only", "requires tls.roots"));
    }

    let mut names = HashSet::new();
    for (i, horizon) in config.horizons.iter().enumerate() {
        if horizon.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("horizons[{i}].name"), "must not be empty"));
        } else if !names.insert(horizon.name.as_str()) {
            errors.push(ValidationError::new(
                format!("horizons[{i}].name"),
                format!("duplicate horizon {:?}", horizon.name),
            ));
        }
        for range in &horizon.ranges {
            if range.parse::<IpNet>().is_err() {
                errors.push(ValidationError::new(
                    format!("horizons[{i}].ranges"),
                    format!("invalid CIDR {range:?}"),
                ));
            }
        }
    }

    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address {:?}", obs.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{HorizonConfig, TlsConfig};

    fn valid() -> EdgeConfig {
        EdgeConfig {
            name: "edge".into(),
            ..EdgeConfig::default()
        }
    }

    fn tls(roots: bool) -> Option<TlsConfig> {
        Some(TlsConfig {
            cert: "cert.pem".into(),
            key: "key.pem".into(),
            roots: roots.then(|| "roots.pem".into()),
        })
    }

    #[test]
    fn defaults_with_name_are_valid() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = EdgeConfig::default();
        config.addresses.port_attempts = 0;
        config.horizons = vec![
            HorizonConfig {
                name: "a".into(),
                ranges: vec!["10.0.0.0/8".into(), "nope".into()],
            },
            HorizonConfig {
                name: "a".into(),
                ranges: vec![],
            },
        ];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            ["name", "addresses.port_attempts", "horizons[0].ranges", "horizons[1].name"]
        );
    }

    #[test]
    fn conflicting_ports() {
        let mut config = valid();
        config.tls = tls(false);
        config.http.enable_insecure = true;
        config.http.port = 8080;
        config.http.insecure_port = 8080;
        config.dns.enabled = true;
        config.dns.port = 853;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].to_string(), "http.insecure_port: conflicts with http.port (8080)");
        assert_eq!(errors[1].field, "dns.tls_port");
    }

    #[test]
    fn mtls_requires_roots() {
        let mut config = valid();
        config.tls = tls(false);
        config.http.mtls_only = true;
        assert_eq!(validate_config(&config).unwrap_err()[0].field, "http.mtls_only");

        config.tls = tls(true);
        assert!(validate_config(&config).is_ok());
    }
}
