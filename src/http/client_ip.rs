//! Client IP resolution behind trusted proxies.

use axum::http::HeaderMap;
use std::collections::HashSet;
use std::net::IpAddr;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Placeholder for requests with no usable address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Resolves the address a request originated from.
///
/// Forwarding headers are only believed when the socket peer is a trusted proxy.
/// `X-Forwarded-For` is walked right to left and the first hop that is not itself a
/// trusted proxy wins; `X-Real-IP` is the fallback.
#[derive(Debug, Clone, Copy)]
pub struct ClientIpResolver<'a> {
    trusted_proxies: &'a HashSet<IpAddr>,
}

impl<'a> ClientIpResolver<'a> {
    pub fn new(trusted_proxies: &'a HashSet<IpAddr>) -> Self {
        Self { trusted_proxies }
    }

    pub fn resolve(&self, peer: Option<IpAddr>, headers: &HeaderMap) -> String {
        let Some(peer) = peer else {
            return UNKNOWN_CLIENT.to_string();
        };

        if !self.trusted_proxies.contains(&peer) {
            return peer.to_string();
        }

        self.from_forwarded_for(headers)
            .or_else(|| header_ip(headers, X_REAL_IP))
            .unwrap_or(peer)
            .to_string()
    }

    fn from_forwarded_for(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let mut hops = Vec::new();
        for value in headers.get_all(X_FORWARDED_FOR) {
            let value = value.to_str().ok()?;
            hops.extend(value.split(',').map(str::trim).filter(|hop| !hop.is_empty()));
        }

        let mut leftmost = None;
        for hop in hops.iter().rev() {
            let ip: IpAddr = hop.parse().ok()?;
            if !self.trusted_proxies.contains(&ip) {
                return Some(ip);
            }
            leftmost = Some(ip);
        }
        // Every hop was a trusted proxy.
        leftmost
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn trusted() -> HashSet<IpAddr> {
        ["127.0.0.1", "10.0.0.2"]
            .iter()
            .map(|ip| ip.parse().unwrap())
            .collect()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_untrusted_peer_ignores_headers() {
        let proxies = trusted();
        let resolver = ClientIpResolver::new(&proxies);
        let ip = resolver.resolve(
            Some("198.51.100.9".parse().unwrap()),
            &headers(&[(X_FORWARDED_FOR, "1.2.3.4")]),
        );
        assert_eq!(ip, "198.51.100.9");
    }

    #[test]
    fn test_rightmost_untrusted_hop() {
        let proxies = trusted();
        let resolver = ClientIpResolver::new(&proxies);
        let ip = resolver.resolve(
            Some("127.0.0.1".parse().unwrap()),
            &headers(&[(X_FORWARDED_FOR, "6.6.6.6, 203.0.113.7, 10.0.0.2")]),
        );
        assert_eq!(ip, "203.0.113.7");
    }

    #[test]
    fn test_multiple_forwarded_for_headers() {
        let proxies = trusted();
        let resolver = ClientIpResolver::new(&proxies);
        let ip = resolver.resolve(
            Some("127.0.0.1".parse().unwrap()),
            &headers(&[(X_FORWARDED_FOR, "6.6.6.6"), (X_FORWARDED_FOR, "203.0.113.7")]),
        );
        assert_eq!(ip, "203.0.113.7");
    }

    #[test]
    fn test_real_ip_fallback() {
        let proxies = trusted();
        let resolver = ClientIpResolver::new(&proxies);
        let peer = Some("127.0.0.1".parse().unwrap());

        assert_eq!(
            resolver.resolve(peer, &headers(&[(X_REAL_IP, "203.0.113.8")])),
            "203.0.113.8"
        );
        assert_eq!(
            resolver.resolve(
                peer,
                &headers(&[(X_FORWARDED_FOR, "not-an-ip"), (X_REAL_IP, "203.0.113.8")])
            ),
            "203.0.113.8"
        );
        assert_eq!(resolver.resolve(peer, &HeaderMap::new()), "127.0.0.1");
    }

    #[test]
    fn test_missing_peer_is_unknown() {
        let proxies = trusted();
        let resolver = ClientIpResolver::new(&proxies);
        let ip = resolver.resolve(None, &headers(&[(X_FORWARDED_FOR, "203.0.113.7")]));
        assert_eq!(ip, UNKNOWN_CLIENT);
    }

    #[test]
    fn test_ipv6_is_canonicalized() {
        let proxies = HashSet::new();
        let resolver = ClientIpResolver::new(&proxies);
        let ip = resolver.resolve(Some("0:0:0:0:0:0:0:1".parse().unwrap()), &HeaderMap::new());
        assert_eq!(ip, "::1");
    }
}
