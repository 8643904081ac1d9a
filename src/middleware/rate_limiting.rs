//! # Rate Limiting System
//!
//! Sliding-window rate limiting per (client, endpoint), backed by a shared store so every
//! gateway replica sees the same counts.
//!
//! For each check the store:
//! 1. removes timestamps at or before `now - window`
//! 2. records the current request
//! 3. counts the entries left in the window
//! 4. refreshes the key's expiry to twice the window
//!
//! and the limiter denies (and un-records) the request when the count exceeds the
//! effective limit `max_requests * burst_multiplier`. The Redis store runs these steps as
//! one `MULTI`/`EXEC` pipeline over a sorted set, so concurrent requests for one key can
//! only be over-denied transiently, never over-admitted.
//!
//! ## Failure semantics
//! Store errors and store timeouts **fail open**: the request is allowed, the event is
//! logged and counted. Availability of the gateway wins over strictness of the policy.
//!
//! ## Usage Example
//! ```rust,no_run
//! use intent_gateway::middleware::rate_limiting::{RateLimiter, RateLimitConfig};
//!
//! # async fn demo() {
//! let limiter = RateLimiter::in_memory(RateLimitConfig::default());
//! let decision = limiter.check_rate_limit("ip:10.0.0.1", "/api/v1/context").await;
//! assert!(decision.allowed);
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether routes with `rate_limit: true` are checked at all
    pub enabled: bool,
    /// Requests allowed per window before burst headroom
    pub max_requests: u32,
    /// Length of the sliding window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Multiplier applied to `max_requests` for burst headroom (>= 1.0)
    pub burst_multiplier: f64,
    /// Key prefix for store entries
    pub key_prefix: String,
    /// Bound on one store round trip; exceeding it fails open
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
    /// Redis connection string; the in-memory store is used when absent
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window: Duration::from_secs(60),
            burst_multiplier: 1.0,
            key_prefix: "rate_limit".to_string(),
            store_timeout: Duration::from_millis(250),
            redis_url: None,
        }
    }
}

impl RateLimitConfig {
    /// Requests admitted per window once burst headroom is applied
    pub fn effective_limit(&self) -> u64 {
        let limit = (self.max_requests as f64 * self.burst_multiplier.max(1.0)).floor();
        limit.max(1.0) as u64
    }
}

/// Rate limit decision result
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Effective limit for the window
    pub limit: u64,
    pub remaining: u64,
    /// When the oldest request in the window expires
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<Duration>,
    /// The store was unavailable and the request was let through
    pub fail_open: bool,
}

impl RateLimitResult {
    /// `reset_at` as unix seconds, for `X-RateLimit-Reset`
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at.timestamp().max(0) as u64
    }
}

/// Window contents observed by the store after recording a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Entries in the window, including the request just recorded
    pub count: u64,
    /// Timestamp (ms) of the oldest entry still in the window
    pub oldest_ms: Option<u64>,
}

/// Trait for rate limiting storage backends
///
/// `record` must prune, insert and count as one atomic step per key.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window: Duration,
    ) -> Result<WindowSnapshot, RateLimitError>;

    /// Remove a previously recorded member (used when the request is denied)
    async fn forget(&self, key: &str, member: &str) -> Result<(), RateLimitError>;

    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Drop windows with no entry newer than `now - window`
    ///
    /// Stores with native key expiry (Redis) have nothing to do here.
    async fn purge_expired(&self, _now_ms: u64, _window: Duration) -> Result<usize, RateLimitError> {
        Ok(0)
    }
}

/// Source of wall-clock milliseconds
///
/// Timestamps are shared across replicas through the store, so this is wall-clock
/// time rather than a monotonic instant.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// In-memory storage implementation
///
/// Each key's timestamps live behind its DashMap shard lock, which makes `record`
/// atomic per key within one process.
#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<String, VecDeque<(u64, String)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose newest entry is older than `max_age`, returning how many went
    pub fn cleanup_expired(&self, now_ms: u64, max_age: Duration) -> usize {
        let cutoff = now_ms.saturating_sub(max_age.as_millis() as u64);
        let before = self.data.len();
        self.data
            .retain(|_, entries| entries.back().map_or(false, |(ts, _)| *ts > cutoff));
        before.saturating_sub(self.data.len())
    }

    pub fn key_count(&self) -> usize {
        self.data.len()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window: Duration,
    ) -> Result<WindowSnapshot, RateLimitError> {
        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        let mut entries = self.data.entry(key.to_string()).or_default();

        while entries.front().map_or(false, |(ts, _)| *ts <= cutoff) {
            entries.pop_front();
        }
        entries.push_back((now_ms, member.to_string()));

        Ok(WindowSnapshot {
            count: entries.len() as u64,
            oldest_ms: entries.front().map(|(ts, _)| *ts),
        })
    }

    async fn forget(&self, key: &str, member: &str) -> Result<(), RateLimitError> {
        if let Some(mut entries) = self.data.get_mut(key) {
            entries.retain(|(_, m)| m != member);
        }
        self.data.remove_if(key, |_, entries| entries.is_empty());
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.data.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now_ms: u64, window: Duration) -> Result<usize, RateLimitError> {
        Ok(self.cleanup_expired(now_ms, window))
    }
}

/// Redis storage implementation over sorted sets (score = timestamp ms)
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect and keep a self-healing multiplexed connection
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = RedisClient::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window: Duration,
    ) -> Result<WindowSnapshot, RateLimitError> {
        let mut conn = self.manager.clone();
        let window_ms = window.as_millis() as u64;
        let cutoff = now_ms.saturating_sub(window_ms);

        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms.saturating_mul(2))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(WindowSnapshot {
            count,
            oldest_ms: oldest.first().map(|(_, score)| *score as u64),
        })
    }

    async fn forget(&self, key: &str, member: &str) -> Result<(), RateLimitError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Counters for admitted and denied decisions
#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
    pub fail_open: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub fail_open: u64,
}

impl RateLimitMetrics {
    pub fn snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
        }
    }
}

/// Main rate limiter implementation
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    metrics: RateLimitMetrics,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            metrics: RateLimitMetrics::default(),
        }
    }

    /// Limiter over a process-local store
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(InMemoryStore::new()))
    }

    /// Build the limiter the configuration asks for
    ///
    /// An unreachable Redis at startup is not fatal: the limiter switches to an
    /// in-memory store for the life of the process and logs a warning. Only a malformed
    /// URL or another setup failure is an error here.
    pub async fn from_config(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        let store: Arc<dyn RateLimitStore> = match &config.redis_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(RateLimitError::Redis(e)) if e.is_connection_refusal() || e.is_io_error() => {
                    warn!(error = %e, "Redis unavailable at startup, using in-memory rate limit store");
                    Arc::new(InMemoryStore::new())
                }
                Err(e) => return Err(e),
            },
            None => Arc::new(InMemoryStore::new()),
        };
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RateLimitMetrics {
        &self.metrics
    }

    /// Store key for a (client, endpoint) pair
    pub fn key_for(&self, client_id: &str, endpoint: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, client_id, endpoint)
    }

    /// Decide whether `client_id` may call `endpoint` now
    ///
    /// Never fails: store errors and timeouts produce an allowed, `fail_open` result.
    pub async fn check_rate_limit(&self, client_id: &str, endpoint: &str) -> RateLimitResult {
        let key = self.key_for(client_id, endpoint);
        let limit = self.config.effective_limit();
        let window = self.config.window;
        let now_ms = self.clock.now_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let recorded = tokio::time::timeout(
            self.config.store_timeout,
            self.store.record(&key, &member, now_ms, window),
        )
        .await;

        let snapshot = match recorded {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Rate limit store error, failing open");
                return self.fail_open(limit, now_ms);
            }
            Err(_) => {
                warn!(
                    key = %key,
                    timeout_ms = self.config.store_timeout.as_millis() as u64,
                    "Rate limit store timed out, failing open"
                );
                return self.fail_open(limit, now_ms);
            }
        };

        let reset_ms = snapshot.oldest_ms.unwrap_or(now_ms) + window.as_millis() as u64;
        let reset_at = millis_to_datetime(reset_ms);

        if snapshot.count > limit {
            match tokio::time::timeout(
                self.config.store_timeout,
                self.store.forget(&key, &member),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(key = %key, error = %e, "Failed to remove denied request from window");
                }
                Err(_) => warn!(
                    key = %key,
                    timeout_ms = self.config.store_timeout.as_millis() as u64,
                    "Rate limit store timed out removing denied request"
                ),
            }
            self.metrics.denied.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_rate_limit_decisions_total", "decision" => "denied")
                .increment(1);
            debug!(key = %key, count = snapshot.count, limit, "Rate limit exceeded");

            return RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after: Some(Duration::from_millis(reset_ms.saturating_sub(now_ms))),
                fail_open: false,
            };
        }

        self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_rate_limit_decisions_total", "decision" => "allowed")
            .increment(1);

        RateLimitResult {
            allowed: true,
            limit,
            remaining: limit - snapshot.count,
            reset_at,
            retry_after: None,
            fail_open: false,
        }
    }

    /// Sweep windows that have aged out of the store
    pub async fn purge_expired(&self) -> Result<usize, RateLimitError> {
        self.store
            .purge_expired(self.clock.now_millis(), self.config.window)
            .await
    }

    /// Run [`RateLimiter::purge_expired`] every `interval` until `shutdown` fires
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match limiter.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "Purged expired rate limit windows"),
                    Err(e) => warn!(error = %e, "Rate limit window cleanup failed"),
                }
            }
            debug!("Rate limit cleanup stopped");
        })
    }

    /// Clear the window for a (client, endpoint) pair
    pub async fn reset(&self, client_id: &str, endpoint: &str) -> Result<(), RateLimitError> {
        self.store.reset(&self.key_for(client_id, endpoint)).await
    }

    fn fail_open(&self, limit: u64, now_ms: u64) -> RateLimitResult {
        self.metrics.fail_open.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_rate_limit_decisions_total", "decision" => "fail_open")
            .increment(1);
        RateLimitResult {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: millis_to_datetime(now_ms + self.config.window.as_millis() as u64),
            retry_after: None,
            fail_open: true,
        }
    }
}

fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}
