//! Admission control subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → http::middleware (client IP, request context)
//!     → AdmissionGate (whitelist, key extraction, quota resolution)
//!     → Limiter::allow (local token bucket or shared-store atomic script)
//!     → rate limit headers, 429 on breach, fail open on backend error
//! ```
//!
//! # Design Decisions
//! - Continuous-refill token bucket everywhere; one formula for both backends
//! - Per-key state is owned by exactly one limiter
//! - Backend failures surface as errors; only `AdmissionGate` turns them into fail-open

use async_trait::async_trait;

pub mod bucket;
pub mod error;
pub mod key;
pub mod local;
pub mod manager;
pub mod policy;
pub mod remote;

pub use bucket::{BucketState, Decision};
pub use error::{RateLimitError, RateLimitResult};
pub use key::{
    endpoint_key, identity_and_endpoint_key, ip_and_endpoint_key, KeyExtractor, KeyFn,
    RequestContext,
};
pub use local::LocalLimiter;
pub use manager::{ActivePolicy, Admission, AdmissionGate, LimitCallback, Manager, ManagerBuilder};
pub use policy::{Policy, Quota, Strategy};
pub use remote::{BucketStore, RedisStore, RemoteLimiter};

/// A token bucket limiter keyed by opaque strings.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Consume one token from `key`'s bucket if one is available.
    ///
    /// Never panics; every failure is returned as an error.
    async fn allow(&self, key: &str, quota: Quota) -> RateLimitResult<Decision>;

    /// Release background work and state. Further `allow` calls fail with `Closed`.
    async fn close(&self) -> RateLimitResult<()>;

    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;
}
