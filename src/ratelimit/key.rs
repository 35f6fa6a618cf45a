//! Rate limit key extraction.
//!
//! Keys are deterministic: equal inputs under the same strategy always map to the
//! same bucket.

use std::fmt;
use std::sync::Arc;

use crate::ratelimit::error::{RateLimitError, RateLimitResult};
use crate::ratelimit::policy::Strategy;

/// What the host HTTP layer tells admission control about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Resolved client IP (already unwrapped from trusted proxies).
    pub client_ip: String,
    /// Authenticated identity, if any.
    pub identity: Option<String>,
    pub method: String,
    /// Route path; the matched route template when the router knows it.
    pub path: String,
}

impl RequestContext {
    pub fn new(client_ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            identity: None,
            method: method.into(),
            path: path.into(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Normalized "METHOD:/path" used for per-endpoint limits.
    pub fn endpoint_key(&self) -> String {
        endpoint_key(&self.method, &self.path)
    }
}

/// Build a normalized "METHOD:/path" key.
pub fn endpoint_key(method: &str, path: &str) -> String {
    format!("{}:{}", method.to_ascii_uppercase(), normalize_path(path))
}

/// Strip trailing slashes; the root path stays "/".
pub fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Normalize a configured "METHOD:/path" key, or `None` if it is not one.
pub(crate) fn normalize_endpoint_key(raw: &str) -> Option<String> {
    let (method, path) = raw.trim().split_once(':')?;
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    if !path.starts_with('/') {
        return None;
    }
    Some(endpoint_key(method, path))
}

/// Caller-supplied key function for [`Strategy::Custom`].
pub type KeyFn = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

/// Maps a request to its bucket key.
#[derive(Clone)]
pub enum KeyExtractor {
    Ip,
    Identity,
    IpAndIdentity,
    Endpoint,
    Custom(KeyFn),
}

impl KeyExtractor {
    /// Select the extractor for a strategy. `Custom` requires a key function.
    pub fn for_strategy(strategy: Strategy, custom: Option<KeyFn>) -> RateLimitResult<Self> {
        match strategy {
            Strategy::Ip => Ok(KeyExtractor::Ip),
            Strategy::Identity => Ok(KeyExtractor::Identity),
            Strategy::IpAndIdentity => Ok(KeyExtractor::IpAndIdentity),
            Strategy::Endpoint => Ok(KeyExtractor::Endpoint),
            Strategy::Custom => custom.map(KeyExtractor::Custom).ok_or_else(|| {
                RateLimitError::InvalidPolicy("custom strategy requires a key function".into())
            }),
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            KeyExtractor::Ip => Strategy::Ip,
            KeyExtractor::Identity => Strategy::Identity,
            KeyExtractor::IpAndIdentity => Strategy::IpAndIdentity,
            KeyExtractor::Endpoint => Strategy::Endpoint,
            KeyExtractor::Custom(_) => Strategy::Custom,
        }
    }

    /// Compute the key. Only a custom function can fail, by returning an empty key.
    pub fn extract(&self, ctx: &RequestContext) -> RateLimitResult<String> {
        let key = match self {
            KeyExtractor::Ip => ip_key(ctx),
            KeyExtractor::Identity => match &ctx.identity {
                Some(id) => format!("user:{}", id),
                None => ip_key(ctx),
            },
            KeyExtractor::IpAndIdentity => match &ctx.identity {
                Some(id) => format!("ip:{}:user:{}", ctx.client_ip, id),
                None => ip_key(ctx),
            },
            KeyExtractor::Endpoint => format!("endpoint:{}", ctx.endpoint_key()),
            KeyExtractor::Custom(f) => {
                let key = f(ctx);
                if key.trim().is_empty() {
                    return Err(RateLimitError::KeyResolutionAmbiguous);
                }
                key
            }
        };
        Ok(key)
    }
}

fn ip_key(ctx: &RequestContext) -> String {
    format!("ip:{}", ctx.client_ip)
}

/// Key function counting each client per endpoint: "ip:{ip}:{METHOD}:{path}".
///
/// Pass to [`ManagerBuilder::key_fn`](crate::ratelimit::ManagerBuilder::key_fn) with the
/// `custom` strategy.
pub fn ip_and_endpoint_key(ctx: &RequestContext) -> String {
    format!("ip:{}:{}", ctx.client_ip, ctx.endpoint_key())
}

/// Key function counting each identity per endpoint: "user:{id}:{METHOD}:{path}".
/// Anonymous callers fall back to [`ip_and_endpoint_key`].
pub fn identity_and_endpoint_key(ctx: &RequestContext) -> String {
    match &ctx.identity {
        Some(id) => format!("user:{}:{}", id, ctx.endpoint_key()),
        None => ip_and_endpoint_key(ctx),
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyExtractor({})", self.strategy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("203.0.113.7", "GET", "/api/v1/players/search/")
    }

    #[test]
    fn test_ip_key() {
        let key = KeyExtractor::Ip.extract(&ctx().with_identity("76561198")).unwrap();
        assert_eq!(key, "ip:203.0.113.7");
    }

    #[test]
    fn test_identity_key_falls_back_to_ip() {
        let extractor = KeyExtractor::Identity;
        assert_eq!(
            extractor.extract(&ctx().with_identity("76561198")).unwrap(),
            "user:76561198"
        );
        assert_eq!(extractor.extract(&ctx()).unwrap(), "ip:203.0.113.7");
    }

    #[test]
    fn test_ip_and_identity_key() {
        let extractor = KeyExtractor::IpAndIdentity;
        assert_eq!(
            extractor.extract(&ctx().with_identity("42")).unwrap(),
            "ip:203.0.113.7:user:42"
        );
        assert_eq!(extractor.extract(&ctx()).unwrap(), "ip:203.0.113.7");
    }

    #[test]
    fn test_endpoint_key_is_shared_across_clients() {
        let a = KeyExtractor::Endpoint.extract(&ctx()).unwrap();
        let b = KeyExtractor::Endpoint
            .extract(&RequestContext::new("198.51.100.1", "get", "/api/v1/players/search"))
            .unwrap();
        assert_eq!(a, "endpoint:GET:/api/v1/players/search");
        assert_eq!(a, b);
    }

    #[test]
    fn test_custom_key() {
        let f: KeyFn = Arc::new(|ctx: &RequestContext| format!("tenant:{}", ctx.method));
        let extractor = KeyExtractor::for_strategy(Strategy::Custom, Some(f)).unwrap();
        assert_eq!(extractor.extract(&ctx()).unwrap(), "tenant:GET");

        let empty: KeyFn = Arc::new(|_: &RequestContext| String::new());
        let extractor = KeyExtractor::Custom(empty);
        assert_eq!(
            extractor.extract(&ctx()),
            Err(RateLimitError::KeyResolutionAmbiguous)
        );
    }

    #[test]
    fn test_endpoint_scoped_key_functions() {
        let per_ip = KeyExtractor::Custom(Arc::new(ip_and_endpoint_key));
        assert_eq!(
            per_ip.extract(&ctx().with_identity("42")).unwrap(),
            "ip:203.0.113.7:GET:/api/v1/players/search"
        );

        let per_user = KeyExtractor::Custom(Arc::new(identity_and_endpoint_key));
        assert_eq!(
            per_user.extract(&ctx().with_identity("42")).unwrap(),
            "user:42:GET:/api/v1/players/search"
        );
        assert_eq!(
            per_user.extract(&ctx()).unwrap(),
            "ip:203.0.113.7:GET:/api/v1/players/search"
        );

        let other = RequestContext::new("203.0.113.7", "POST", "/api/v1/players/search");
        assert_ne!(per_ip.extract(&other).unwrap(), per_ip.extract(&ctx()).unwrap());
    }

    #[test]
    fn test_custom_strategy_requires_function() {
        assert!(matches!(
            KeyExtractor::for_strategy(Strategy::Custom, None),
            Err(RateLimitError::InvalidPolicy(_))
        ));
        assert_eq!(
            KeyExtractor::for_strategy(Strategy::Endpoint, None)
                .unwrap()
                .strategy(),
            Strategy::Endpoint
        );
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_path("/a/b/"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(endpoint_key("post", "/x//"), "POST:/x");
        assert_eq!(
            normalize_endpoint_key(" get:/api/v1/players/search/ ").as_deref(),
            Some("GET:/api/v1/players/search")
        );
        assert_eq!(normalize_endpoint_key("/missing-method"), None);
        assert_eq!(normalize_endpoint_key("GET:relative"), None);
    }
}
