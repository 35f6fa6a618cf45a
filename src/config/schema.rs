//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ratelimit::Strategy;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Admission control (rate limiting) configuration.
    pub rate_limit: RateLimitConfig,

    /// Shared bucket store settings.
    pub redis: RedisConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Rate limiting configuration, as read from disk.
///
/// Turned into a validated [`crate::ratelimit::Policy`] before use.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Key strategy.
    pub strategy: Strategy,

    /// Steady-state refill rate per key.
    pub requests_per_second: u32,

    /// Bucket capacity. Must be >= `requests_per_second`.
    pub burst: u32,

    /// Keep bucket state in the shared store instead of in-process.
    pub use_redis: bool,

    /// Idle time after which a key's bucket is dropped.
    pub key_ttl_secs: u64,

    /// How often the in-process limiter sweeps idle keys.
    pub sweep_interval_secs: u64,

    /// Upper bound on a single shared-store round trip.
    pub backend_timeout_ms: u64,

    /// Per-endpoint limits, keyed by "METHOD:/path".
    pub per_endpoint: HashMap<String, u32>,

    /// Client IPs that are never limited.
    pub whitelist: Vec<String>,

    /// Proxies whose forwarding headers are trusted.
    pub trusted_proxies: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::Ip,
            requests_per_second: 100,
            burst: 200,
            use_redis: true,
            key_ttl_secs: 60,
            sweep_interval_secs: 30,
            backend_timeout_ms: 100,
            per_endpoint: HashMap::new(),
            whitelist: vec!["127.0.0.1".to_string(), "::1".to_string()],
            trusted_proxies: vec!["127.0.0.1".to_string()],
        }
    }
}

impl RateLimitConfig {
    /// Relaxed limits with an in-process backend, for local development.
    pub fn development() -> Self {
        Self {
            requests_per_second: 1000,
            burst: 2000,
            use_redis: false,
            key_ttl_secs: 300,
            ..Self::default()
        }
    }
}

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL.
    pub url: String,

    /// Prefix prepended to every bucket key.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ratelimit:".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.strategy, Strategy::Ip);
        assert_eq!(config.rate_limit.requests_per_second, 100);
        assert_eq!(config.rate_limit.burst, 200);
        assert!(config.rate_limit.use_redis);
        assert_eq!(config.redis.key_prefix, "ratelimit:");
    }

    #[test]
    fn test_development_preset() {
        let config = RateLimitConfig::development();
        assert!(!config.use_redis);
        assert_eq!(config.requests_per_second, 1000);
        assert_eq!(config.burst, 2000);
        assert_eq!(config.whitelist, vec!["127.0.0.1", "::1"]);
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [rate_limit]
            strategy = "ip_and_user"
            requests_per_second = 5
            burst = 10

            [rate_limit.per_endpoint]
            "GET:/api/v1/players/search" = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.strategy, Strategy::IpAndIdentity);
        assert_eq!(config.rate_limit.requests_per_second, 5);
        assert_eq!(
            config.rate_limit.per_endpoint.get("GET:/api/v1/players/search"),
            Some(&1)
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.rate_limit.key_ttl_secs, 60);
    }
}
