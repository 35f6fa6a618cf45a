//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the demo handlers
//! - Wire up middleware (admission control, timeout, request ID, tracing)
//! - Serve with connect info and graceful shutdown
//! - Apply config reloads to the rate limit manager

use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::AppConfig;
use crate::http::middleware::rate_limit_middleware;
use crate::http::request::{MakeRequestUuid, X_REQUEST_ID};
use crate::lifecycle::ShutdownSignal;
use crate::ratelimit::{Manager, Policy};

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    rate_limit_backend: &'static str,
}

#[derive(Debug, Serialize)]
struct Echo {
    method: String,
    path: String,
    request_id: Option<String>,
}

/// HTTP server fronting the admission middleware.
pub struct HttpServer {
    router: Router,
    config: AppConfig,
    manager: Arc<Manager>,
}

impl HttpServer {
    pub fn new(config: AppConfig, manager: Arc<Manager>) -> Self {
        let router = Self::build_router(&config, &manager);
        Self {
            router,
            config,
            manager,
        }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// `/health` is registered after the admission layer and is never limited.
    fn build_router(config: &AppConfig, manager: &Manager) -> Router {
        let gate = manager.gate();
        let backend = gate.backend();

        Router::new()
            .fallback(echo)
            .layer(middleware::from_fn_with_state(gate, rate_limit_middleware))
            .route(
                "/health",
                get(move || async move {
                    Json(Health {
                        status: "ok",
                        rate_limit_backend: backend,
                    })
                }),
            )
            .layer(request_timeout(config))
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
    }

    /// The router, for driving the server without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Serve until `shutdown` fires, applying config updates as they arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<AppConfig>,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let manager = self.manager.clone();
        let reloader = tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                apply_config(&manager, &config);
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.recv().await })
            .await;

        reloader.abort();
        result?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Hand a reloaded config's rate limit section to the manager.
pub fn apply_config(manager: &Manager, config: &AppConfig) {
    match Policy::from_config(&config.rate_limit).and_then(|policy| manager.update_config(policy)) {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(error = %e, "Rejected rate limit config reload, keeping current policy");
        }
    }
}

async fn echo(request: Request<Body>) -> Json<Echo> {
    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Json(Echo {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        request_id,
    })
}

/// Requests running past `timeouts.request_secs` get 408.
fn request_timeout(config: &AppConfig) -> TimeoutLayer {
    TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(config.timeouts.request_secs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    use crate::http::middleware::X_RATELIMIT_LIMIT;

    fn server(policy: Policy) -> HttpServer {
        let manager = Arc::new(Manager::new(policy, None).unwrap());
        HttpServer::new(AppConfig::default(), manager)
    }

    fn request(uri: &str) -> Request<Body> {
        let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 5000))));
        request
    }

    #[tokio::test]
    async fn test_health_is_not_limited() {
        let app = server(Policy::new(1, 1)).router();

        for _ in 0..5 {
            let response = app.clone().oneshot(request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        }
    }

    #[tokio::test]
    async fn test_echo_is_limited_and_has_request_id() {
        let app = server(Policy::new(1, 1)).router();

        let first = app.clone().oneshot(request("/api/v1/players/search")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(first.headers().get(&X_REQUEST_ID).is_some());

        let second = app.clone().oneshot(request("/anything/else")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_slow_request_times_out() {
        let mut config = AppConfig::default();
        config.timeouts.request_secs = 1;
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    "done"
                }),
            )
            .layer(request_timeout(&config));

        let response = app.oneshot(request("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_apply_config() {
        let manager = Manager::new(Policy::new(100, 200), None).unwrap();

        let mut config = AppConfig::default();
        config.rate_limit.use_redis = false;
        config.rate_limit.requests_per_second = 5;
        config.rate_limit.burst = 5;
        apply_config(&manager, &config);
        assert_eq!(manager.policy().requests_per_second, 5);

        // Invalid reloads are ignored.
        config.rate_limit.burst = 1;
        apply_config(&manager, &config);
        assert_eq!(manager.policy().burst, 5);
    }
}
