//! Metrics collection and exposition.
//!
//! # Metrics
//! - `admission_decisions_total` (counter): decisions by outcome
//! - `admission_backend_errors_total` (counter): limiter failures by backend
//! - `admission_local_buckets` (gauge): live in-process buckets
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are low-cardinality; keys and IPs never become labels

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// What the middleware did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Limited,
    /// Skipped: disabled, whitelisted, or no key.
    Bypassed,
    /// Limiter failed and the request was admitted anyway.
    FailOpen,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Limited => "limited",
            Outcome::Bypassed => "bypassed",
            Outcome::FailOpen => "fail_open",
        }
    }
}

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_decision(outcome: Outcome) {
    counter!("admission_decisions_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn record_backend_error(backend: &'static str) {
    counter!("admission_backend_errors_total", "backend" => backend).increment(1);
}

pub fn record_local_buckets(count: usize) {
    gauge!("admission_local_buckets").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::Allowed.as_str(), "allowed");
        assert_eq!(Outcome::FailOpen.as_str(), "fail_open");
    }

    #[test]
    fn test_recording_without_exporter() {
        record_decision(Outcome::Limited);
        record_backend_error("redis");
        record_local_buckets(3);
    }
}
