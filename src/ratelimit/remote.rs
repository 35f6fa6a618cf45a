//! Token bucket whose state lives in a shared store.
//!
//! # Responsibilities
//! - Run refill-and-take as one atomic step in the store (a Lua script for Redis)
//! - Expire idle keys through the store's TTL instead of a sweep
//! - Bound every round trip with a timeout
//!
//! # Design Decisions
//! - No local caching: every decision reads the shared state
//! - Unreachable store or unexpected reply is an error, never a guessed decision

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::ratelimit::bucket::{unix_millis, BucketState, Decision};
use crate::ratelimit::error::{RateLimitError, RateLimitResult};
use crate::ratelimit::policy::Quota;
use crate::ratelimit::Limiter;

/// Atomic refill-and-take.
///
/// KEYS[1] bucket hash. ARGV: rate, capacity, ttl_ms, now_ms.
/// Returns {allowed, remaining, wait_ms, reset_in_ms}.
const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.max(0, math.min(capacity, tokens + (elapsed / 1000) * rate))
last_refill = math.max(last_refill, now)

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', last_refill)
redis.call('PEXPIRE', key, ttl_ms)

local wait_ms = 0
local reset_in_ms = math.ceil((capacity - tokens) / rate * 1000)
if allowed == 0 then
    wait_ms = math.ceil((1 - tokens) / rate * 1000)
    reset_in_ms = wait_ms
end

return {allowed, math.floor(tokens), wait_ms, reset_in_ms}
"#;

/// Shared storage for bucket state.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill and try to take one token, atomically with respect to every other caller.
    async fn take(
        &self,
        key: &str,
        quota: Quota,
        ttl: Duration,
        now_ms: u64,
    ) -> RateLimitResult<Decision>;

    /// Current stored state, if the key exists.
    async fn fetch(&self, key: &str) -> RateLimitResult<Option<BucketState>>;

    /// Drop a key's state.
    async fn reset(&self, key: &str) -> RateLimitResult<()>;

    /// Connectivity check.
    async fn ping(&self) -> RateLimitResult<()>;

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Redis-backed bucket store.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis and verify the connection.
    pub async fn connect(url: &str) -> RateLimitResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            RateLimitError::BackendUnavailable(format!("invalid redis url: {}", e))
        })?;
        let connection = ConnectionManager::new(client).await.map_err(backend_error)?;

        let store = Self::from_connection(connection);
        store.ping().await?;
        tracing::debug!("Connected to redis for rate limiting");
        Ok(store)
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(TAKE_SCRIPT),
        }
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn take(
        &self,
        key: &str,
        quota: Quota,
        ttl: Duration,
        now_ms: u64,
    ) -> RateLimitResult<Decision> {
        let mut conn = self.connection.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let reply: Value = self
            .script
            .key(key)
            .arg(quota.rate)
            .arg(quota.burst)
            .arg(ttl_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        decode_reply(&reply, quota, now_ms)
    }

    async fn fetch(&self, key: &str) -> RateLimitResult<Option<BucketState>> {
        let mut conn = self.connection.clone();
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        match fields.as_slice() {
            [Some(tokens), Some(last_refill)] => {
                let tokens: f64 = tokens.parse().map_err(|_| {
                    RateLimitError::MalformedBackendResponse(format!("tokens '{}'", tokens))
                })?;
                let last_refill: f64 = last_refill.parse().map_err(|_| {
                    RateLimitError::MalformedBackendResponse(format!("last_refill '{}'", last_refill))
                })?;
                Ok(Some(BucketState {
                    tokens,
                    last_refill_ms: last_refill as u64,
                }))
            }
            [None, None] => Ok(None),
            _ => Err(RateLimitError::MalformedBackendResponse(format!(
                "unexpected HMGET reply for '{}'",
                key
            ))),
        }
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn ping(&self) -> RateLimitResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}

fn backend_error(e: RedisError) -> RateLimitError {
    if e.kind() == ErrorKind::TypeError {
        RateLimitError::MalformedBackendResponse(e.to_string())
    } else {
        RateLimitError::BackendUnavailable(e.to_string())
    }
}

/// Turn the script reply into a decision, rejecting anything but four sane integers.
pub(crate) fn decode_reply(reply: &Value, quota: Quota, now_ms: u64) -> RateLimitResult<Decision> {
    let items = match reply {
        Value::Array(items) if items.len() == 4 => items,
        other => {
            return Err(RateLimitError::MalformedBackendResponse(format!(
                "expected 4-element array, got {:?}",
                other
            )))
        }
    };

    let mut fields = [0i64; 4];
    for (slot, item) in fields.iter_mut().zip(items) {
        *slot = match item {
            Value::Int(n) if *n >= 0 => *n,
            other => {
                return Err(RateLimitError::MalformedBackendResponse(format!(
                    "expected non-negative integer, got {:?}",
                    other
                )))
            }
        };
    }

    let [allowed, remaining, wait_ms, reset_in_ms] = fields;
    if allowed > 1 {
        return Err(RateLimitError::MalformedBackendResponse(format!(
            "allowed flag {}",
            allowed
        )));
    }

    let remaining = (remaining as u64).min(quota.burst as u64) as u32;
    Ok(Decision::from_parts(
        allowed == 1,
        quota.rate,
        remaining,
        now_ms,
        wait_ms as u64,
        reset_in_ms as u64,
    ))
}

/// Distributed limiter: the local process holds no lock and no state.
pub struct RemoteLimiter {
    store: Arc<dyn BucketStore>,
    key_prefix: String,
    key_ttl: Duration,
    timeout: Duration,
    closed: AtomicBool,
}

impl RemoteLimiter {
    pub fn new(store: Arc<dyn BucketStore>, key_ttl: Duration, timeout: Duration) -> Self {
        Self {
            store,
            key_prefix: "ratelimit:".to_string(),
            key_ttl,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T>(&self, call: impl Future<Output = RateLimitResult<T>>) -> RateLimitResult<T> {
        match time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::BackendUnavailable(format!(
                "no reply within {:?}",
                self.timeout
            ))),
        }
    }

    /// Stored state for a key, if any.
    pub async fn state(&self, key: &str) -> RateLimitResult<Option<BucketState>> {
        self.bounded(self.store.fetch(&self.store_key(key))).await
    }

    /// Forget a key's bucket.
    pub async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.bounded(self.store.reset(&self.store_key(key))).await
    }

    pub async fn ping(&self) -> RateLimitResult<()> {
        self.bounded(self.store.ping()).await
    }
}

#[async_trait]
impl Limiter for RemoteLimiter {
    async fn allow(&self, key: &str, quota: Quota) -> RateLimitResult<Decision> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::Closed);
        }

        let store_key = self.store_key(key);
        let decision = self
            .bounded(self.store.take(&store_key, quota, self.key_ttl, unix_millis()))
            .await?;

        tracing::trace!(
            key = %store_key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Remote rate limit check"
        );
        Ok(decision)
    }

    async fn close(&self) -> RateLimitResult<()> {
        // The connection belongs to the store; nothing else to release.
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        self.store.name()
    }
}
