//! Limiter ownership and live policy.
//!
//! # Responsibilities
//! - Validate the policy and pick the limiter backend once, at construction
//! - Hold policy, key extractor and limit callback behind one `ArcSwap`
//! - Hand out [`AdmissionGate`]s that evaluate requests against the live policy
//!
//! # Design Decisions
//! - A policy update replaces the whole snapshot; requests see the old or the new one, never a mix
//! - Backend selection, key TTL, sweep interval and backend timeout are fixed for the
//!   manager's lifetime; an update that changes them is rejected
//! - An endpoint with its own limit gets its own bucket, so the client's global bucket
//!   is untouched by requests to it
//! - Limiter errors become [`Admission::FailOpen`]; nothing here rejects on a backend fault

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::schema::AppConfig;
use crate::observability::metrics::{self, Outcome};
use crate::ratelimit::bucket::Decision;
use crate::ratelimit::error::{RateLimitError, RateLimitResult};
use crate::ratelimit::key::{KeyExtractor, KeyFn, RequestContext};
use crate::ratelimit::local::LocalLimiter;
use crate::ratelimit::policy::Policy;
use crate::ratelimit::remote::{BucketStore, RedisStore, RemoteLimiter};
use crate::ratelimit::Limiter;

/// Called with the request and its bucket key whenever a request is rejected.
pub type LimitCallback = Arc<dyn Fn(&RequestContext, &str) + Send + Sync>;

/// Policy plus everything derived from it.
#[derive(Clone)]
pub struct ActivePolicy {
    pub policy: Policy,
    pub extractor: KeyExtractor,
    pub on_limit_reached: Option<LimitCallback>,
}

impl fmt::Debug for ActivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePolicy")
            .field("policy", &self.policy)
            .field("extractor", &self.extractor)
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

/// What admission control decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Not subject to limiting: disabled, whitelisted, or no key.
    Bypassed,
    Allowed(Decision),
    Limited { key: String, decision: Decision },
    /// The limiter failed; forward the request without rate limit headers.
    FailOpen(RateLimitError),
}

/// Cheap handle evaluating requests against the manager's live policy.
#[derive(Clone)]
pub struct AdmissionGate {
    state: Arc<ArcSwap<ActivePolicy>>,
    limiter: Arc<dyn Limiter>,
}

impl AdmissionGate {
    /// Current policy snapshot. Use one snapshot for the whole request.
    pub fn active(&self) -> Arc<ActivePolicy> {
        self.state.load_full()
    }

    /// Evaluate a request against the current policy.
    pub async fn admit(&self, ctx: &RequestContext) -> Admission {
        let active = self.active();
        self.admit_with(&active, ctx).await
    }

    /// Evaluate a request against a snapshot the caller already holds.
    pub async fn admit_with(&self, active: &ActivePolicy, ctx: &RequestContext) -> Admission {
        let policy = &active.policy;

        if !policy.enabled || policy.is_whitelisted(&ctx.client_ip) {
            metrics::record_decision(Outcome::Bypassed);
            return Admission::Bypassed;
        }

        let key = match active.extractor.extract(ctx) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(
                    strategy = %active.extractor.strategy(),
                    method = %ctx.method,
                    path = %ctx.path,
                    error = %e,
                    "No rate limit key, skipping"
                );
                metrics::record_decision(Outcome::Bypassed);
                return Admission::Bypassed;
            }
        };

        let endpoint = ctx.endpoint_key();
        let quota = policy.resolve_quota(&endpoint);
        let key = bucket_key(policy, key, &endpoint);

        match self.limiter.allow(&key, quota).await {
            Ok(decision) if decision.allowed => {
                metrics::record_decision(Outcome::Allowed);
                Admission::Allowed(decision)
            }
            Ok(decision) => {
                tracing::warn!(
                    key = %key,
                    client_ip = %ctx.client_ip,
                    endpoint = %endpoint,
                    limit = decision.limit,
                    retry_after = decision.retry_after_secs(),
                    "Rate limit exceeded"
                );
                if let Some(callback) = &active.on_limit_reached {
                    callback(ctx, &key);
                }
                metrics::record_decision(Outcome::Limited);
                Admission::Limited { key, decision }
            }
            Err(e) if e.is_backend_failure() => {
                tracing::warn!(
                    key = %key,
                    strategy = %policy.strategy,
                    backend = self.limiter.backend(),
                    error = %e,
                    "Rate limiter failed, admitting request"
                );
                metrics::record_backend_error(self.limiter.backend());
                metrics::record_decision(Outcome::FailOpen);
                Admission::FailOpen(e)
            }
            Err(e) => {
                tracing::error!(
                    key = %key,
                    strategy = %policy.strategy,
                    error = %e,
                    "Unexpected rate limiter error, admitting request"
                );
                metrics::record_decision(Outcome::FailOpen);
                Admission::FailOpen(e)
            }
        }
    }

    pub fn backend(&self) -> &'static str {
        self.limiter.backend()
    }
}

/// Overridden endpoints are counted apart from the client's global bucket.
fn bucket_key(policy: &Policy, key: String, endpoint: &str) -> String {
    if policy.per_endpoint.contains_key(endpoint) {
        format!("{}|{}", key, endpoint)
    } else {
        key
    }
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    policy: Policy,
    store: Option<Arc<dyn BucketStore>>,
    key_prefix: Option<String>,
    key_fn: Option<KeyFn>,
    on_limit_reached: Option<LimitCallback>,
}

impl ManagerBuilder {
    /// Shared store used when the policy selects the remote backend.
    pub fn store(mut self, store: Arc<dyn BucketStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Namespace for keys in the shared store.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Key function for the `custom` strategy.
    pub fn key_fn(mut self, key_fn: impl Fn(&RequestContext) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn on_limit_reached(
        mut self,
        callback: impl Fn(&RequestContext, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> RateLimitResult<Manager> {
        self.policy.validate()?;
        let extractor = KeyExtractor::for_strategy(self.policy.strategy, self.key_fn.clone())?;

        let limiter: Arc<dyn Limiter> = match (self.policy.use_remote_backend, self.store) {
            (true, Some(store)) => {
                let mut remote =
                    RemoteLimiter::new(store, self.policy.key_ttl, self.policy.backend_timeout);
                if let Some(prefix) = self.key_prefix {
                    remote = remote.with_prefix(prefix);
                }
                Arc::new(remote)
            }
            (true, None) => {
                tracing::warn!("Remote backend selected but no store available, using local limiter");
                Arc::new(LocalLimiter::new(self.policy.key_ttl, self.policy.sweep_interval))
            }
            (false, _) => Arc::new(LocalLimiter::new(
                self.policy.key_ttl,
                self.policy.sweep_interval,
            )),
        };

        tracing::info!(
            enabled = self.policy.enabled,
            strategy = %self.policy.strategy,
            requests_per_second = self.policy.requests_per_second,
            burst = self.policy.burst,
            endpoint_overrides = self.policy.per_endpoint.len(),
            backend = limiter.backend(),
            "Rate limiting configured"
        );

        let state = ActivePolicy {
            policy: self.policy,
            extractor,
            on_limit_reached: self.on_limit_reached,
        };

        Ok(Manager {
            state: Arc::new(ArcSwap::from_pointee(state)),
            limiter,
            key_fn: self.key_fn,
            closed: AtomicBool::new(false),
        })
    }
}

/// Owns one limiter and the policy it is driven by.
pub struct Manager {
    state: Arc<ArcSwap<ActivePolicy>>,
    limiter: Arc<dyn Limiter>,
    key_fn: Option<KeyFn>,
    closed: AtomicBool,
}

impl Manager {
    pub fn builder(policy: Policy) -> ManagerBuilder {
        ManagerBuilder {
            policy,
            store: None,
            key_prefix: None,
            key_fn: None,
            on_limit_reached: None,
        }
    }

    /// Validate `policy` and start the selected limiter.
    pub fn new(policy: Policy, store: Option<Arc<dyn BucketStore>>) -> RateLimitResult<Self> {
        let mut builder = Self::builder(policy);
        builder.store = store;
        builder.build()
    }

    /// Build from application config, connecting to Redis when the remote backend is selected.
    ///
    /// An unreachable Redis at startup degrades to the local limiter.
    pub async fn connect(config: &AppConfig) -> RateLimitResult<Self> {
        let policy = Policy::from_config(&config.rate_limit)?;
        let mut builder = Self::builder(policy.clone()).key_prefix(config.redis.key_prefix.clone());

        if policy.use_remote_backend {
            match RedisStore::connect(&config.redis.url).await {
                Ok(store) => {
                    tracing::info!(url = %config.redis.url, "Connected to rate limit store");
                    builder = builder.store(Arc::new(store));
                }
                Err(e) => {
                    metrics::record_backend_error("redis");
                    tracing::warn!(url = %config.redis.url, error = %e, "Rate limit store unreachable");
                }
            }
        }

        builder.build()
    }

    /// Validate and swap in a new policy.
    ///
    /// On error the current policy stays in force.
    pub fn update_config(&self, policy: Policy) -> RateLimitResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::Closed);
        }
        policy.validate()?;

        let current = self.state.load();
        if policy.use_remote_backend != current.policy.use_remote_backend {
            return Err(RateLimitError::InvalidPolicy(
                "backend selection cannot change at runtime".into(),
            ));
        }
        if policy.key_ttl != current.policy.key_ttl {
            return Err(RateLimitError::InvalidPolicy("key_ttl cannot change at runtime".into()));
        }
        if policy.sweep_interval != current.policy.sweep_interval {
            return Err(RateLimitError::InvalidPolicy(
                "sweep_interval cannot change at runtime".into(),
            ));
        }
        if policy.backend_timeout != current.policy.backend_timeout {
            return Err(RateLimitError::InvalidPolicy(
                "backend_timeout cannot change at runtime".into(),
            ));
        }
        drop(current);
        let extractor = KeyExtractor::for_strategy(policy.strategy, self.key_fn.clone())?;

        self.state.rcu(|current| ActivePolicy {
            policy: policy.clone(),
            extractor: extractor.clone(),
            on_limit_reached: current.on_limit_reached.clone(),
        });

        tracing::info!(
            enabled = policy.enabled,
            strategy = %policy.strategy,
            requests_per_second = policy.requests_per_second,
            burst = policy.burst,
            endpoint_overrides = policy.per_endpoint.len(),
            "Rate limit policy updated"
        );
        Ok(())
    }

    /// Replace the limit-reached callback.
    pub fn set_on_limit_reached(&self, callback: impl Fn(&RequestContext, &str) + Send + Sync + 'static) {
        let callback: LimitCallback = Arc::new(callback);
        self.state.rcu(|current| ActivePolicy {
            on_limit_reached: Some(callback.clone()),
            ..ActivePolicy::clone(current)
        });
    }

    pub fn policy(&self) -> Policy {
        self.state.load().policy.clone()
    }

    pub fn limiter(&self) -> Arc<dyn Limiter> {
        self.limiter.clone()
    }

    pub fn gate(&self) -> AdmissionGate {
        AdmissionGate {
            state: self.state.clone(),
            limiter: self.limiter.clone(),
        }
    }

    /// Close the limiter. Idempotent.
    pub async fn close(&self) -> RateLimitResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.limiter.close().await?;
        tracing::info!(backend = self.limiter.backend(), "Rate limit manager closed");
        Ok(())
    }
}
