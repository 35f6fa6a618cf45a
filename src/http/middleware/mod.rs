//! HTTP middleware.

pub mod rate_limit;

pub use rate_limit::{
    rate_limit_middleware, request_context, Identity, RejectionBody, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
