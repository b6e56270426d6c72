//! Metrics collection and exposition.
//!
//! # Metrics
//! - `edgy_http_forbidden_total` (counter): requests refused by horizon routing
//! - `edgy_dns_refused_total` (counter): queries refused by horizon routing
//! - `edgy_dns_queries_total` (counter): queries received, by `proto`
//! - `edgy_listeners_active` (gauge): serving listeners, by `proto`
//! - `edgy_worker_failures_total` (counter): worker tasks that failed

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with a scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_http_forbidden() {
    metrics::counter!("edgy_http_forbidden_total").increment(1);
}

pub fn record_dns_refused() {
    metrics::counter!("edgy_dns_refused_total").increment(1);
}

pub fn record_dns_query(proto: &'static str) {
    metrics::counter!("edgy_dns_queries_total", "proto" => proto).increment(1);
}

pub fn record_worker_failure() {
    metrics::counter!("edgy_worker_failures_total").increment(1);
}

/// Counts a listener as active until dropped.
#[derive(Debug)]
pub struct ActiveListener {
    proto: &'static str,
}

impl ActiveListener {
    pub fn new(proto: &'static str) -> Self {
        metrics::gauge!("edgy_listeners_active", "proto" => proto).increment(1.0);
        Self { proto }
    }
}

impl Drop for ActiveListener {
    fn drop(&mut self) {
        metrics::gauge!("edgy_listeners_active", "proto" => self.proto).decrement(1.0);
    }
}
