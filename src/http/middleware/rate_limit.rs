//! Admission control as an axum middleware.

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::http::client_ip::ClientIpResolver;
use crate::ratelimit::{Admission, AdmissionGate, Decision, RequestContext};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Authenticated caller, inserted into request extensions by the host's auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub limit: u32,
    pub reset_at: u64,
    pub retry_after: u64,
}

/// Rate limit every request passing through this layer.
///
/// Backend failures are admitted without rate limit headers.
pub async fn rate_limit_middleware(
    State(gate): State<AdmissionGate>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let active = gate.active();
    if !active.policy.enabled {
        return next.run(request).await;
    }

    let ctx = request_context(&request, &active.policy.trusted_proxies);
    match gate.admit_with(&active, &ctx).await {
        Admission::Bypassed | Admission::FailOpen(_) => next.run(request).await,
        Admission::Allowed(decision) => {
            let mut response = next.run(request).await;
            set_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Admission::Limited { decision, .. } => limited_response(&decision),
    }
}

/// Describe a request in the terms admission control works with.
pub fn request_context(request: &Request<Body>, trusted_proxies: &HashSet<IpAddr>) -> RequestContext {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = ClientIpResolver::new(trusted_proxies).resolve(peer, request.headers());

    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str())
        .unwrap_or_else(|| request.uri().path());

    let mut ctx = RequestContext::new(client_ip, request.method().as_str(), path);
    if let Some(Identity(id)) = request.extensions().get::<Identity>() {
        ctx = ctx.with_identity(id.clone());
    }
    ctx
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
}

fn limited_response(decision: &Decision) -> Response {
    let body = RejectionBody {
        error: "rate limit exceeded".to_string(),
        limit: decision.limit,
        reset_at: decision.reset_at,
        retry_after: decision.retry_after_secs(),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    set_rate_limit_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
    response
}
