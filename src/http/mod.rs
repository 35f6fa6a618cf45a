//! HTTP integration.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, timeout, tracing)
//!     → middleware::rate_limit (client IP, request context, admission)
//!     → handler, or 429 with rate limit headers
//! ```

pub mod client_ip;
pub mod middleware;
pub mod request;
pub mod server;

pub use client_ip::ClientIpResolver;
pub use middleware::{rate_limit_middleware, Identity, RejectionBody};
pub use request::{MakeRequestUuid, X_REQUEST_ID};
pub use server::HttpServer;
