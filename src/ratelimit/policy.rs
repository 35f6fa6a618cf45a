//! Admission policy: validated rate limiting configuration.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::schema::RateLimitConfig;
use crate::ratelimit::error::{RateLimitError, RateLimitResult};
use crate::ratelimit::key::normalize_endpoint_key;

/// How requests are grouped into buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One bucket per client IP.
    #[default]
    Ip,
    /// One bucket per authenticated identity, IP for anonymous callers.
    #[serde(rename = "user", alias = "identity")]
    Identity,
    /// One bucket per (IP, identity) pair.
    #[serde(rename = "ip_and_user", alias = "ip_and_identity")]
    IpAndIdentity,
    /// One global bucket per method and path.
    Endpoint,
    /// Key supplied by a caller-provided function.
    Custom,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Ip => "ip",
            Strategy::Identity => "user",
            Strategy::IpAndIdentity => "ip_and_user",
            Strategy::Endpoint => "endpoint",
            Strategy::Custom => "custom",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate and capacity of a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quota {
    /// Tokens added per second.
    pub rate: u32,
    /// Maximum tokens held.
    pub burst: u32,
}

impl Quota {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self { rate, burst }
    }

    /// Quota whose capacity equals its rate.
    pub fn per_second(rate: u32) -> Self {
        Self { rate, burst: rate }
    }
}

/// Validated admission policy.
///
/// Immutable once handed to the [`crate::ratelimit::Manager`]; replaced wholesale by
/// `update_config`, never patched field by field.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub enabled: bool,
    pub strategy: Strategy,
    pub requests_per_second: u32,
    pub burst: u32,
    pub use_remote_backend: bool,
    pub key_ttl: Duration,
    pub sweep_interval: Duration,
    pub backend_timeout: Duration,
    /// Normalized "METHOD:/path" -> requests per second.
    pub per_endpoint: HashMap<String, u32>,
    pub whitelist: HashSet<String>,
    pub trusted_proxies: HashSet<IpAddr>,
}

impl Policy {
    /// An enabled, in-process, per-IP policy with the given rate and burst.
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        Self {
            enabled: true,
            strategy: Strategy::Ip,
            requests_per_second,
            burst,
            use_remote_backend: false,
            key_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            backend_timeout: Duration::from_millis(100),
            per_endpoint: HashMap::new(),
            whitelist: HashSet::new(),
            trusted_proxies: HashSet::new(),
        }
    }

    /// Build and validate a policy from its on-disk form.
    pub fn from_config(config: &RateLimitConfig) -> RateLimitResult<Self> {
        let mut per_endpoint = HashMap::with_capacity(config.per_endpoint.len());
        for (raw, limit) in &config.per_endpoint {
            let key = normalize_endpoint_key(raw).ok_or_else(|| {
                RateLimitError::InvalidPolicy(format!(
                    "per-endpoint key '{}' must look like METHOD:/path",
                    raw
                ))
            })?;
            per_endpoint.insert(key, *limit);
        }

        let mut trusted_proxies = HashSet::with_capacity(config.trusted_proxies.len());
        for raw in &config.trusted_proxies {
            let ip: IpAddr = raw.trim().parse().map_err(|_| {
                RateLimitError::InvalidPolicy(format!("trusted proxy '{}' is not an IP address", raw))
            })?;
            trusted_proxies.insert(ip);
        }

        let policy = Self {
            enabled: config.enabled,
            strategy: config.strategy,
            requests_per_second: config.requests_per_second,
            burst: config.burst,
            use_remote_backend: config.use_redis,
            key_ttl: Duration::from_secs(config.key_ttl_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            backend_timeout: Duration::from_millis(config.backend_timeout_ms),
            per_endpoint,
            whitelist: config.whitelist.iter().map(|ip| canonical_ip(ip)).collect(),
            trusted_proxies,
        };

        policy.validate()?;
        Ok(policy)
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_endpoint_limit(mut self, endpoint: &str, limit: u32) -> Self {
        let key = normalize_endpoint_key(endpoint).unwrap_or_else(|| endpoint.to_string());
        self.per_endpoint.insert(key, limit);
        self
    }

    pub fn with_whitelisted(mut self, ip: &str) -> Self {
        self.whitelist.insert(canonical_ip(ip));
        self
    }

    pub fn with_trusted_proxy(mut self, ip: IpAddr) -> Self {
        self.trusted_proxies.insert(ip);
        self
    }

    pub fn with_key_ttl(mut self, ttl: Duration) -> Self {
        self.key_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_remote_backend(mut self, enabled: bool) -> Self {
        self.use_remote_backend = enabled;
        self
    }

    /// Check the policy invariants.
    pub fn validate(&self) -> RateLimitResult<()> {
        if self.requests_per_second == 0 {
            return Err(RateLimitError::InvalidPolicy(
                "requests_per_second must be positive".into(),
            ));
        }
        if self.burst == 0 {
            return Err(RateLimitError::InvalidPolicy("burst must be positive".into()));
        }
        if self.burst < self.requests_per_second {
            return Err(RateLimitError::InvalidPolicy(
                "burst must be >= requests_per_second".into(),
            ));
        }
        if let Some((endpoint, _)) = self.per_endpoint.iter().find(|(_, limit)| **limit == 0) {
            return Err(RateLimitError::InvalidPolicy(format!(
                "limit for endpoint '{}' must be positive",
                endpoint
            )));
        }
        if self.key_ttl.is_zero() {
            return Err(RateLimitError::InvalidPolicy("key_ttl must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(RateLimitError::InvalidPolicy(
                "sweep_interval must be positive".into(),
            ));
        }
        if self.backend_timeout.is_zero() {
            return Err(RateLimitError::InvalidPolicy(
                "backend_timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Requests per second for an endpoint; overrides win over the global rate.
    pub fn resolve_limit(&self, endpoint_key: &str) -> u32 {
        self.resolve_quota(endpoint_key).rate
    }

    /// Bucket quota for an endpoint.
    pub fn resolve_quota(&self, endpoint_key: &str) -> Quota {
        match self.per_endpoint.get(endpoint_key) {
            Some(limit) => Quota::per_second(*limit),
            None => Quota::new(self.requests_per_second, self.burst),
        }
    }

    /// Exact-match whitelist lookup.
    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.contains(ip)
    }
}

/// Canonical textual form of an IP; non-IP strings are kept as given.
fn canonical_ip(raw: &str) -> String {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Policy::new(10, 20).validate().is_ok());
        assert!(Policy::new(10, 10).validate().is_ok());

        assert!(matches!(
            Policy::new(0, 10).validate(),
            Err(RateLimitError::InvalidPolicy(_))
        ));
        assert!(matches!(
            Policy::new(10, 0).validate(),
            Err(RateLimitError::InvalidPolicy(_))
        ));
        let err = Policy::new(10, 5).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid rate limit policy: burst must be >= requests_per_second"
        );
    }

    #[test]
    fn test_zero_endpoint_limit_rejected() {
        let policy = Policy::new(10, 10).with_endpoint_limit("GET:/a", 0);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_resolve_limit_prefers_endpoint_override() {
        let policy = Policy::new(100, 200).with_endpoint_limit("GET:/api/v1/players/search", 1);

        assert_eq!(policy.resolve_limit("GET:/api/v1/players/search"), 1);
        assert_eq!(policy.resolve_limit("GET:/api/v1/profile"), 100);
        assert_eq!(
            policy.resolve_quota("GET:/api/v1/players/search"),
            Quota::new(1, 1)
        );
        assert_eq!(policy.resolve_quota("POST:/x"), Quota::new(100, 200));
    }

    #[test]
    fn test_whitelist_is_exact_match() {
        let policy = Policy::new(1, 1)
            .with_whitelisted("10.0.0.1")
            .with_whitelisted("0:0:0:0:0:0:0:1");

        assert!(policy.is_whitelisted("10.0.0.1"));
        assert!(policy.is_whitelisted("::1"));
        assert!(!policy.is_whitelisted("10.0.0.2"));
        assert!(!policy.is_whitelisted("10.0.0.0/24"));
    }

    #[test]
    fn test_from_config() {
        let mut config = RateLimitConfig::development();
        config.strategy = Strategy::Endpoint;
        config
            .per_endpoint
            .insert("get:/api/v1/players/search/".into(), 3);

        let policy = Policy::from_config(&config).unwrap();
        assert_eq!(policy.strategy, Strategy::Endpoint);
        assert!(!policy.use_remote_backend);
        assert_eq!(policy.resolve_limit("GET:/api/v1/players/search"), 3);
        assert!(policy.is_whitelisted("127.0.0.1"));
        assert!(policy
            .trusted_proxies
            .contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_from_config_rejects_bad_input() {
        let mut config = RateLimitConfig::development();
        config.per_endpoint.insert("no-method-here".into(), 3);
        assert!(Policy::from_config(&config).is_err());

        let mut config = RateLimitConfig::development();
        config.trusted_proxies = vec!["proxy.internal".into()];
        assert!(Policy::from_config(&config).is_err());

        let mut config = RateLimitConfig::development();
        config.burst = 1;
        assert!(Policy::from_config(&config).is_err());
    }

    #[test]
    fn test_strategy_names() {
        let parsed: Strategy = serde_json::from_str("\"identity\"").unwrap();
        assert_eq!(parsed, Strategy::Identity);
        let parsed: Strategy = serde_json::from_str("\"ip_and_user\"").unwrap();
        assert_eq!(parsed, Strategy::IpAndIdentity);
        assert_eq!(Strategy::Identity.to_string(), "user");
    }
}
