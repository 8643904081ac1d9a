//! Circuit Breaker Implementation
//!
//! Stops calls to a failing downstream service and probes for recovery. One breaker exists
//! per service, shared by every concurrent request to it.
//!
//! ## States:
//! - **Closed**: calls pass through; outcomes inside `failure_window` are remembered and the
//!   breaker trips once `failure_threshold` failures and `min_throughput` total outcomes are seen
//! - **Open**: calls are rejected with [`CircuitOpenError`] until `recovery_timeout` elapses
//! - **HalfOpen**: exactly one probe call may be in flight; a failure reopens the breaker,
//!   `success_threshold` consecutive successes close it
//!
//! Every read-then-transition happens under one `parking_lot::Mutex`, so two requests racing
//! for the half-open probe slot cannot both be admitted.
//!
//! ## Key Rust Concepts:
//! - [`BreakerPermit`] is an RAII guard: dropping it without reporting an outcome (the caller's
//!   future was cancelled) frees the probe slot without counting a failure
//! - `AtomicU64` counters give lock-free statistics for the admin API
//! - A generation counter lets late outcomes from a previous state be ignored safely

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::error::GatewayError;

/// Returned when a breaker rejects a call without running it
#[derive(Debug, Error, Clone)]
#[error("Circuit breaker is open for service {service} until {until}")]
pub struct CircuitOpenError {
    pub service: String,
    /// Time left until the breaker will admit a probe
    pub retry_after: Duration,
    /// Wall-clock estimate of `last_state_change + recovery_timeout`
    pub until: DateTime<Utc>,
}

impl From<CircuitOpenError> for GatewayError {
    fn from(err: CircuitOpenError) -> Self {
        GatewayError::CircuitOpen {
            service: err.service,
            retry_after: err.retry_after,
        }
    }
}

/// Outcome of [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The operation was not invoked
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    /// The operation ran and failed; the failure was recorded
    #[error("{0}")]
    Operation(E),
}

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window needed to open the circuit
    pub failure_threshold: u32,

    /// How long to stay Open before admitting a probe
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// How long a half-open probe may run before it is treated as failed
    #[serde(with = "humantime_serde")]
    pub half_open_timeout: Duration,

    /// Sliding window over which outcomes are counted
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,

    /// Total outcomes inside the window required before the circuit may open
    pub min_throughput: u32,

    /// Consecutive probe successes needed to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(120),
            min_throughput: 5,
            success_threshold: 1,
        }
    }
}

/// Metrics collected by the circuit breaker
///
/// Uses atomic operations for lock-free updates from multiple tasks
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    /// Calls rejected without running
    pub rejected_requests: AtomicU64,
    /// Admitted calls dropped before reporting an outcome
    pub cancelled_requests: AtomicU64,
    pub circuit_opened_count: AtomicU64,
    pub circuit_closed_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            circuit_opened_count: self.circuit_opened_count.load(Ordering::Relaxed),
            circuit_closed_count: self.circuit_closed_count.load(Ordering::Relaxed),
        }
    }

    /// Calculate failure rate as a percentage
    pub fn failure_rate(&self) -> f64 {
        let completed = self.successful_requests.load(Ordering::Relaxed)
            + self.failed_requests.load(Ordering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        let failed = self.failed_requests.load(Ordering::Relaxed);
        (failed as f64 / completed as f64) * 100.0
    }
}

/// Immutable snapshot of circuit breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub cancelled_requests: u64,
    pub circuit_opened_count: u64,
    pub circuit_closed_count: u64,
}

/// Diagnostic view of one breaker for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub last_state_change: DateTime<Utc>,
    pub failures_in_window: usize,
    pub outcomes_in_window: usize,
    pub probe_in_flight: bool,
    pub retry_after_seconds: Option<u64>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub config: CircuitBreakerConfig,
    pub metrics: CircuitBreakerMetricsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    /// Admitted while Closed
    Normal,
    /// The single half-open probe, tagged with the generation that admitted it
    Probe { generation: u64 },
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    last_state_change: Instant,
    last_state_change_wall: DateTime<Utc>,
    /// (when, failed)
    outcomes: VecDeque<(Instant, bool)>,
    probe_started: Option<Instant>,
    half_open_probe_count: u32,
    consecutive_successes: u32,
    /// Bumped on every transition
    generation: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            last_state_change: Instant::now(),
            last_state_change_wall: Utc::now(),
            outcomes: VecDeque::new(),
            probe_started: None,
            half_open_probe_count: 0,
            consecutive_successes: 0,
            generation: 0,
            last_failure_time: None,
            last_success_time: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.outcomes.front() {
            if now.duration_since(at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, failed)| *failed).count()
    }

    fn enter(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.last_state_change = now;
        self.last_state_change_wall = Utc::now();
        self.probe_started = None;
        self.consecutive_successes = 0;
        self.generation += 1;
    }
}

/// Main circuit breaker implementation
///
/// Thread-safe: share it behind an `Arc` and call [`CircuitBreaker::call`] or
/// [`CircuitBreaker::try_acquire`] from any task.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    ///
    /// # Example
    /// ```rust
    /// use intent_gateway::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    /// let cb = CircuitBreaker::new("context_service", CircuitBreakerConfig::default());
    /// assert!(cb.try_acquire().is_ok());
    /// ```
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Run `operation` under the breaker
    ///
    /// The closure is not invoked when the breaker rejects the call. `Ok` counts as a
    /// success and `Err` as a failure; callers that need to classify outcomes themselves
    /// (for example treating 4xx responses as successes) use [`CircuitBreaker::try_acquire`].
    /// If the returned future is dropped mid-flight nothing is recorded.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(err) => {
                permit.record_failure();
                Err(CallError::Operation(err))
            }
        }
    }

    /// Pre-check: admit one call or reject it
    ///
    /// The returned permit must be resolved with `record_success` / `record_failure`;
    /// dropping it unresolved releases any probe slot without changing state.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let state = inner.state;
        let probe_started = inner.probe_started;

        let kind = match state {
            CircuitState::Closed => PermitKind::Normal,
            CircuitState::Open => {
                let elapsed = now.duration_since(inner.last_state_change);
                if elapsed < self.config.recovery_timeout {
                    return Err(self.reject(&inner, self.config.recovery_timeout - elapsed));
                }
                inner.enter(CircuitState::HalfOpen, now);
                inner.half_open_probe_count = 0;
                info!(service = %self.name, "Circuit entering half-open state");
                self.record_transition(CircuitState::HalfOpen);
                self.admit_probe(&mut inner, now)
            }
            CircuitState::HalfOpen => match probe_started {
                None => self.admit_probe(&mut inner, now),
                Some(started) => {
                    let running = now.duration_since(started);
                    if running >= self.config.half_open_timeout {
                        warn!(
                            service = %self.name,
                            running_ms = running.as_millis() as u64,
                            "Half-open probe exceeded its timeout, reopening circuit"
                        );
                        inner.last_failure_time = Some(Utc::now());
                        self.trip(&mut inner, now);
                        return Err(self.reject(&inner, self.config.recovery_timeout));
                    }
                    return Err(self.reject(&inner, self.config.half_open_timeout - running));
                }
            },
        };

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(BreakerPermit {
            breaker: self,
            kind,
            resolved: false,
        })
    }

    fn admit_probe(&self, inner: &mut Inner, now: Instant) -> PermitKind {
        inner.probe_started = Some(now);
        inner.half_open_probe_count += 1;
        debug!(
            service = %self.name,
            probe = inner.half_open_probe_count,
            "Admitting half-open probe"
        );
        PermitKind::Probe {
            generation: inner.generation,
        }
    }

    fn reject(&self, inner: &Inner, retry_after: Duration) -> CircuitOpenError {
        self.metrics.rejected_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_circuit_rejections_total", "service" => self.name.clone())
            .increment(1);
        let until = inner.last_state_change_wall
            + chrono::Duration::from_std(self.config.recovery_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        CircuitOpenError {
            service: self.name.clone(),
            retry_after,
            until,
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.enter(CircuitState::Open, now);
        self.metrics
            .circuit_opened_count
            .fetch_add(1, Ordering::Relaxed);
        self.record_transition(CircuitState::Open);
    }

    fn record_transition(&self, to: CircuitState) {
        metrics::counter!(
            "gateway_circuit_transitions_total",
            "service" => self.name.clone(),
            "to" => to.to_string()
        )
        .increment(1);
    }

    fn complete(&self, kind: PermitKind, failed: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if failed {
            self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
            inner.last_failure_time = Some(Utc::now());
        } else {
            self.metrics
                .successful_requests
                .fetch_add(1, Ordering::Relaxed);
            inner.last_success_time = Some(Utc::now());
        }

        match kind {
            PermitKind::Normal => {
                // Outcomes admitted under an earlier Closed period only count while still Closed
                if inner.state != CircuitState::Closed {
                    return;
                }
                inner.outcomes.push_back((now, failed));
                inner.prune(now, self.config.failure_window);

                if failed {
                    let failures = inner.failures();
                    let total = inner.outcomes.len();
                    if failures >= self.config.failure_threshold as usize
                        && total >= self.config.min_throughput as usize
                    {
                        warn!(
                            service = %self.name,
                            failures,
                            total,
                            "Circuit opened after failure threshold reached"
                        );
                        self.trip(&mut inner, now);
                    }
                }
            }
            PermitKind::Probe { generation } => {
                if inner.state != CircuitState::HalfOpen || inner.generation != generation {
                    debug!(service = %self.name, "Ignoring outcome of stale probe");
                    return;
                }
                inner.probe_started = None;

                if failed {
                    warn!(service = %self.name, "Circuit reopened after failed recovery probe");
                    self.trip(&mut inner, now);
                    return;
                }

                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    let successes = inner.consecutive_successes;
                    inner.enter(CircuitState::Closed, now);
                    inner.outcomes.clear();
                    self.metrics
                        .circuit_closed_count
                        .fetch_add(1, Ordering::Relaxed);
                    self.record_transition(CircuitState::Closed);
                    info!(
                        service = %self.name,
                        successes,
                        "Circuit closed after successful recovery"
                    );
                }
            }
        }
    }

    fn release(&self, kind: PermitKind) {
        self.metrics
            .cancelled_requests
            .fetch_add(1, Ordering::Relaxed);
        if let PermitKind::Probe { generation } = kind {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::HalfOpen && inner.generation == generation {
                inner.probe_started = None;
                debug!(service = %self.name, "Half-open probe cancelled, slot released");
            }
        }
    }

    /// Force the breaker Closed and forget recent outcomes
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.enter(CircuitState::Closed, now);
        inner.outcomes.clear();
        inner.half_open_probe_count = 0;
        self.metrics
            .circuit_closed_count
            .fetch_add(1, Ordering::Relaxed);
        self.record_transition(CircuitState::Closed);
        info!(service = %self.name, "Circuit reset to closed");
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the name/identifier of this circuit breaker
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get metrics
    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.prune(now, self.config.failure_window);

        let retry_after_seconds = match inner.state {
            CircuitState::Open => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(now.duration_since(inner.last_state_change))
                    .as_secs(),
            ),
            _ => None,
        };

        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            last_state_change: inner.last_state_change_wall,
            failures_in_window: inner.failures(),
            outcomes_in_window: inner.outcomes.len(),
            probe_in_flight: inner.probe_started.is_some(),
            retry_after_seconds,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            config: self.config.clone(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Admission ticket for one call through a [`CircuitBreaker`]
#[must_use = "a permit must be resolved with record_success or record_failure"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is the half-open recovery probe
    pub fn is_probe(&self) -> bool {
        matches!(self.kind, PermitKind::Probe { .. })
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.complete(self.kind, false);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.complete(self.kind, true);
    }

    /// Record an outcome decided by the caller
    pub fn record(self, failed: bool) {
        if failed {
            self.record_failure();
        } else {
            self.record_success();
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.release(self.kind);
        }
    }
}

/// Circuit breaker registry holding one breaker per service
///
/// Breakers are created lazily on first use from the default configuration or a
/// per-service override.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a new circuit breaker registry
    pub fn new(
        default_config: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            default_config,
            overrides,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Configuration a breaker for `name` is (or would be) created with
    pub fn config_for(&self, name: &str) -> &CircuitBreakerConfig {
        self.overrides.get(name).unwrap_or(&self.default_config)
    }

    /// Get or create the circuit breaker for the given service
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(service = %name, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(name, self.config_for(name).clone()))
        });
        Arc::clone(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Reset a service's breaker; false if none exists yet
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Get all circuit breakers
    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }

    pub fn snapshot_all(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.get_all().iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(100),
            half_open_timeout: Duration::from_secs(5),
            failure_window: Duration::from_secs(60),
            min_throughput: 3,
            success_threshold: 1,
        }
    }

    fn fail_times(cb: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            cb.try_acquire().unwrap().record_failure();
        }
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = CircuitBreaker::new("test", test_config());

        fail_times(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail_times(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        assert_eq!(err.service, "test");
        assert!(err.retry_after <= Duration::from_millis(100));
        assert_eq!(cb.metrics().rejected_requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_min_throughput_gates_tripping() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            min_throughput: 4,
            ..test_config()
        };
        let cb = CircuitBreaker::new("test", config);

        fail_times(&cb, 3);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.try_acquire().unwrap().record_success();
        fail_times(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_failures_outside_window_are_forgotten() {
        let config = CircuitBreakerConfig {
            failure_window: Duration::from_millis(50),
            ..test_config()
        };
        let cb = CircuitBreaker::new("test", config);

        fail_times(&cb, 2);
        thread::sleep(Duration::from_millis(80));
        fail_times(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failures_in_window, 1);
    }

    #[test]
    fn test_circuit_breaker_transitions_to_half_open() {
        let cb = CircuitBreaker::new("test", test_config());
        fail_times(&cb, 3);

        thread::sleep(Duration::from_millis(150));

        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Only one probe may be in flight
        assert!(cb.try_acquire().is_err());
        probe.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_reopens_on_failure_in_half_open() {
        let cb = CircuitBreaker::new("test", test_config());
        fail_times(&cb, 3);
        thread::sleep(Duration::from_millis(150));

        cb.try_acquire().unwrap().record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_success_threshold_requires_consecutive_probes() {
        let config = CircuitBreakerConfig {
            success_threshold: 2,
            ..test_config()
        };
        let cb = CircuitBreaker::new("test", config);
        fail_times(&cb, 3);
        thread::sleep(Duration::from_millis(150));

        cb.try_acquire().unwrap().record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.try_acquire().unwrap().record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().outcomes_in_window, 0);
    }

    #[test]
    fn test_dropped_probe_releases_slot() {
        let cb = CircuitBreaker::new("test", test_config());
        fail_times(&cb, 3);
        thread::sleep(Duration::from_millis(150));

        let probe = cb.try_acquire().unwrap();
        drop(probe);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().cancelled_requests.load(Ordering::Relaxed), 1);
        assert!(cb.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn test_stuck_probe_times_out() {
        let config = CircuitBreakerConfig {
            half_open_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let cb = CircuitBreaker::new("test", config);
        fail_times(&cb, 3);
        thread::sleep(Duration::from_millis(150));

        let stuck = cb.try_acquire().unwrap();
        thread::sleep(Duration::from_millis(80));
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // The late success belongs to an older generation and changes nothing
        stuck.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_forces_closed() {
        let cb = CircuitBreaker::new("test", test_config());
        fail_times(&cb, 3);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failures_in_window, 0);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        let cb = CircuitBreaker::with_defaults("test");

        cb.try_acquire().unwrap().record_success();
        cb.try_acquire().unwrap().record_failure();

        let metrics = cb.metrics();
        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.successful_requests.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failed_requests.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failure_rate(), 50.0);

        let snapshot = cb.snapshot();
        assert!(snapshot.last_failure_time.is_some());
        assert!(snapshot.last_success_time.is_some());
    }

    #[tokio::test]
    async fn test_call_skips_operation_when_open() {
        let cb = CircuitBreaker::new("test", test_config());
        fail_times(&cb, 3);

        let mut invoked = false;
        let result: Result<(), CallError<String>> = cb
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(CallError::Open(_))));
        assert!(!invoked);
    }

    #[test]
    fn test_circuit_breaker_registry() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "service2".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        );
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), overrides);

        let cb1 = registry.get_or_create("service1");
        let cb2 = registry.get_or_create("service1");
        let cb3 = registry.get_or_create("service2");

        assert!(Arc::ptr_eq(&cb1, &cb2));
        assert_eq!(cb1.config().failure_threshold, 5);
        assert_eq!(cb3.config().failure_threshold, 1);
        assert_eq!(registry.get_all().len(), 2);

        assert!(registry.reset("service1"));
        assert!(!registry.reset("unknown"));
        assert_eq!(registry.snapshot_all()[0].name, "service1");
    }
}
