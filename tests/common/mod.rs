//! Shared utilities for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use admission_control::config::AppConfig;
use admission_control::http::HttpServer;
use admission_control::lifecycle::Shutdown;
use admission_control::ratelimit::{
    BucketState, BucketStore, Decision, Manager, Quota, RateLimitError, RateLimitResult,
};

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub manager: Arc<Manager>,
    pub config_tx: mpsc::UnboundedSender<AppConfig>,
    shutdown: Shutdown,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

/// Start an `HttpServer` in front of `manager` on 127.0.0.1.
pub async fn spawn_server(manager: Manager) -> TestServer {
    let manager = Arc::new(manager);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (config_tx, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(AppConfig::default(), manager.clone());
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    TestServer {
        addr,
        manager,
        config_tx,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// In-memory bucket store using the same refill math as Redis.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn take(&self, key: &str, quota: Quota, _ttl: Duration, now_ms: u64) -> RateLimitResult<Decision> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState::full(quota, now_ms));
        Ok(bucket.take(quota, now_ms))
    }

    async fn fetch(&self, key: &str) -> RateLimitResult<Option<BucketState>> {
        Ok(self.buckets.lock().unwrap().get(key).copied())
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.buckets.lock().unwrap().remove(key);
        Ok(())
    }

    async fn ping(&self) -> RateLimitResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Store that is always down. Counts how often it was asked.
#[derive(Default)]
pub struct FailingStore {
    pub calls: AtomicUsize,
}

impl FailingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BucketStore for FailingStore {
    async fn take(&self, _: &str, _: Quota, _: Duration, _: u64) -> RateLimitResult<Decision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Let concurrent callers pile up before failing.
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err(RateLimitError::BackendUnavailable("connection refused".into()))
    }

    async fn fetch(&self, _: &str) -> RateLimitResult<Option<BucketState>> {
        Err(RateLimitError::BackendUnavailable("connection refused".into()))
    }

    async fn reset(&self, _: &str) -> RateLimitResult<()> {
        Err(RateLimitError::BackendUnavailable("connection refused".into()))
    }

    async fn ping(&self) -> RateLimitResult<()> {
        Err(RateLimitError::BackendUnavailable("connection refused".into()))
    }
}
