//! In-process token bucket limiter.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::ratelimit::bucket::{BucketState, Decision, MonotonicClock};
use crate::ratelimit::error::{RateLimitError, RateLimitResult};
use crate::ratelimit::policy::Quota;
use crate::ratelimit::Limiter;

/// Token buckets held in a sharded concurrent map.
///
/// Bucket creation goes through the map's entry API, so two concurrent first
/// requests for a key always land in the same bucket. Updates to a bucket happen
/// under its shard lock, which linearizes decisions per key.
pub struct LocalLimiter {
    buckets: Arc<DashMap<String, BucketState>>,
    clock: MonotonicClock,
    key_ttl: Duration,
    closed: AtomicBool,
    shutdown: Shutdown,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalLimiter {
    /// Create a limiter and start its idle-key sweeper on the current Tokio runtime.
    pub fn new(key_ttl: Duration, sweep_interval: Duration) -> Self {
        let limiter = Self {
            buckets: Arc::new(DashMap::new()),
            clock: MonotonicClock::new(),
            key_ttl,
            closed: AtomicBool::new(false),
            shutdown: Shutdown::new(),
            sweeper: Mutex::new(None),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = limiter.spawn_sweeper(&handle, sweep_interval);
                if let Ok(mut slot) = limiter.sweeper.lock() {
                    *slot = Some(task);
                }
            }
            Err(_) => {
                tracing::warn!("No Tokio runtime; idle buckets are only evicted by explicit sweeps");
            }
        }

        limiter
    }

    fn spawn_sweeper(&self, handle: &tokio::runtime::Handle, interval: Duration) -> JoinHandle<()> {
        let buckets = self.buckets.clone();
        let clock = self.clock;
        let ttl_ms = self.key_ttl.as_millis() as u64;
        let mut shutdown = self.shutdown.subscribe();

        handle.spawn(async move {
            let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep_idle(&buckets, clock.now_ms(), ttl_ms);
                        if removed > 0 {
                            tracing::debug!(removed, remaining = buckets.len(), "Evicted idle rate limit buckets");
                        }
                        metrics::record_local_buckets(buckets.len());
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Bucket sweeper received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }

    /// Synchronous core of [`Limiter::allow`].
    pub fn check(&self, key: &str, quota: Quota) -> RateLimitResult<Decision> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::Closed);
        }

        let now = self.clock.now_ms();
        let decision = match self.buckets.get_mut(key) {
            Some(mut bucket) => bucket.take(quota, now),
            None => self
                .buckets
                .entry(key.to_owned())
                .or_insert_with(|| BucketState::full(quota, now))
                .take(quota, now),
        };

        tracing::trace!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Local rate limit check"
        );
        Ok(decision)
    }

    /// Evict buckets idle for at least the key TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_idle(&self.buckets, self.clock.now_ms(), self.key_ttl.as_millis() as u64)
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Copy of a key's bucket state.
    pub fn snapshot(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|b| *b.value())
    }

    /// Replace a key's bucket state, e.g. from a persisted snapshot.
    pub fn restore(&self, key: &str, state: BucketState) {
        self.buckets.insert(key.to_owned(), state);
    }
}

/// Collect idle keys first, then delete them one by one so no shard lock is held
/// for a full scan. A key touched in between is re-checked and kept.
fn sweep_idle(buckets: &DashMap<String, BucketState>, now_ms: u64, ttl_ms: u64) -> usize {
    let is_idle = |state: &BucketState| now_ms.saturating_sub(state.last_refill_ms) >= ttl_ms;

    let idle: Vec<String> = buckets
        .iter()
        .filter(|entry| is_idle(entry.value()))
        .map(|entry| entry.key().clone())
        .collect();

    idle.into_iter()
        .filter(|key| buckets.remove_if(key, |_, state| is_idle(state)).is_some())
        .count()
}

#[async_trait]
impl Limiter for LocalLimiter {
    async fn allow(&self, key: &str, quota: Quota) -> RateLimitResult<Decision> {
        self.check(key, quota)
    }

    async fn close(&self) -> RateLimitResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.trigger();
        let task = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        self.buckets.clear();
        tracing::info!("Local rate limiter closed");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

impl Drop for LocalLimiter {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
