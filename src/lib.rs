//! Admission control for HTTP services.
//!
//! Token bucket rate limiting keyed by client IP, identity, endpoint or a custom
//! function, with an in-process or Redis-backed bucket store and an axum middleware
//! that fails open when the store is unreachable.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod ratelimit;

pub use config::AppConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use ratelimit::{Manager, Policy};
