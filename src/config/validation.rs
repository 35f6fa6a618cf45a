//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::AppConfig;
use crate::ratelimit::key::normalize_endpoint_key;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
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

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check everything serde cannot.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be positive"));
    }

    let rl = &config.rate_limit;
    if rl.requests_per_second == 0 {
        errors.push(ValidationError::new("rate_limit.requests_per_second", "must be positive"));
    }
    if rl.burst == 0 {
        errors.push(ValidationError::new("rate_limit.burst", "must be positive"));
    } else if rl.burst < rl.requests_per_second {
        errors.push(ValidationError::new(
            "rate_limit.burst",
            format!("{} is below requests_per_second ({})", rl.burst, rl.requests_per_second),
        ));
    }
    if rl.key_ttl_secs == 0 {
        errors.push(ValidationError::new("rate_limit.key_ttl_secs", "must be positive"));
    }
    if rl.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("rate_limit.sweep_interval_secs", "must be positive"));
    }
    if rl.backend_timeout_ms == 0 {
        errors.push(ValidationError::new("rate_limit.backend_timeout_ms", "must be positive"));
    }

    for (endpoint, limit) in &rl.per_endpoint {
        let field = format!("rate_limit.per_endpoint.\"{}\"", endpoint);
        if normalize_endpoint_key(endpoint).is_none() {
            errors.push(ValidationError::new(field.clone(), "key must look like METHOD:/path"));
        }
        if *limit == 0 {
            errors.push(ValidationError::new(field, "limit must be positive"));
        }
    }

    for ip in &rl.whitelist {
        if ip.trim().parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                "rate_limit.whitelist",
                format!("'{}' is not an IP address", ip),
            ));
        }
    }
    for ip in &rl.trusted_proxies {
        if ip.trim().parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                "rate_limit.trusted_proxies",
                format!("'{}' is not an IP address", ip),
            ));
        }
    }

    if rl.use_redis {
        match url::Url::parse(&config.redis.url) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss" | "redis+unix" | "unix") => {}
            Ok(url) => errors.push(ValidationError::new(
                "redis.url",
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new("redis.url", e.to_string())),
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
