//! Per-dependency circuit breaker: Closed -> Open -> HalfOpen -> Closed.
//!
//! One breaker instance guards one named dependency (tenant data, LLM, SMS
//! gateway, notifications). Breakers are held in a registry keyed by
//! dependency name so the engine can look one up without threading it
//! through every call site.

use dashmap::DashMap;
use shared_types::CircuitState;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Length of the rolling latency sample ring each breaker keeps, used to
/// recompute a mean latency without retaining unbounded history.
const LATENCY_RING_LEN: usize = 100;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout_ms: 60_000,
            half_open_max_calls: 5,
        }
    }
}

/// One breaker for one dependency. All counters are atomics so that callers
/// on different tokio tasks can record outcomes without a mutex on the hot
/// path; the only thing that needs serializing is the state transition
/// itself, guarded by `transition_lock`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU32, // encodes CircuitState
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_calls: AtomicU32,
    opened_at_ms: AtomicU64,
    transition_lock: tokio::sync::Mutex<()>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    open_count: AtomicU64,
    last_state_change_ms: AtomicU64,
    latency_ring_ms: AsyncMutex<VecDeque<u64>>,
}

/// Lifetime rolling counters for one breaker, used by the metrics dashboard.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub failure_rate: f64,
    pub open_count: u64,
    pub last_state_change_ms: u64,
    pub mean_latency_ms: f64,
    pub latency_samples: Vec<u64>,
}

fn state_to_u32(state: CircuitState) -> u32 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

fn u32_to_state(v: u32) -> CircuitState {
    match v {
        0 => CircuitState::Closed,
        1 => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{0}' is open")]
pub struct CircuitOpenError(pub String);

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU32::new(state_to_u32(CircuitState::Closed)),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            transition_lock: tokio::sync::Mutex::new(()),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            last_state_change_ms: AtomicU64::new(now_ms()),
            latency_ring_ms: AsyncMutex::new(VecDeque::with_capacity(LATENCY_RING_LEN)),
        }
    }

    pub fn state(&self) -> CircuitState {
        u32_to_state(self.state.load(Ordering::Acquire))
    }

    /// Appends a call's latency to the bounded ring, evicting the oldest
    /// sample once the ring is full. Called regardless of call outcome.
    pub async fn record_latency(&self, latency_ms: u64) {
        let mut ring = self.latency_ring_ms.lock().await;
        if ring.len() >= LATENCY_RING_LEN {
            ring.pop_front();
        }
        ring.push_back(latency_ms);
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let total_calls = self.total_calls.load(Ordering::Acquire);
        let total_failures = self.total_failures.load(Ordering::Acquire);
        let ring = self.latency_ring_ms.lock().await;
        let mean_latency_ms = if ring.is_empty() {
            0.0
        } else {
            ring.iter().sum::<u64>() as f64 / ring.len() as f64
        };
        CircuitBreakerMetrics {
            state: self.state(),
            total_calls,
            total_successes: self.total_successes.load(Ordering::Acquire),
            total_failures,
            failure_rate: if total_calls == 0 { 0.0 } else { total_failures as f64 / total_calls as f64 },
            open_count: self.open_count.load(Ordering::Acquire),
            last_state_change_ms: self.last_state_change_ms.load(Ordering::Acquire),
            mean_latency_ms,
            latency_samples: ring.iter().copied().collect(),
        }
    }

    /// Call before attempting the protected operation. Returns an error if
    /// the circuit is open (and the open-timeout hasn't elapsed) or if the
    /// half-open trial-call budget is exhausted.
    pub async fn before_call(&self) -> Result<(), CircuitOpenError> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = now_ms().saturating_sub(self.opened_at_ms.load(Ordering::Acquire));
                if elapsed >= self.config.open_timeout_ms {
                    self.transition_to_half_open().await;
                    Ok(())
                } else {
                    Err(CircuitOpenError(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                let calls = self.half_open_calls.fetch_add(1, Ordering::AcqRel);
                if calls >= self.config.half_open_max_calls {
                    self.half_open_calls.fetch_sub(1, Ordering::AcqRel);
                    Err(CircuitOpenError(self.name.clone()))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::AcqRel);
        self.total_successes.fetch_add(1, Ordering::AcqRel);
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::AcqRel);
        self.total_failures.fetch_add(1, Ordering::AcqRel);
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn transition_to_open(&self) {
        let _guard = self.transition_lock.lock().await;
        self.state.store(state_to_u32(CircuitState::Open), Ordering::Release);
        self.opened_at_ms.store(now_ms(), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.open_count.fetch_add(1, Ordering::AcqRel);
        self.last_state_change_ms.store(now_ms(), Ordering::Release);
        warn!(breaker = %self.name, "circuit breaker opened");
    }

    async fn transition_to_half_open(&self) {
        let _guard = self.transition_lock.lock().await;
        if self.state() != CircuitState::Open {
            return;
        }
        self.state.store(state_to_u32(CircuitState::HalfOpen), Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.last_state_change_ms.store(now_ms(), Ordering::Release);
        info!(breaker = %self.name, "circuit breaker half-open");
    }

    async fn transition_to_closed(&self) {
        let _guard = self.transition_lock.lock().await;
        self.state.store(state_to_u32(CircuitState::Closed), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.last_state_change_ms.store(now_ms(), Ordering::Release);
        info!(breaker = %self.name, "circuit breaker closed");
    }
}

/// Named registry of breakers, one per dependency, shared across the engine.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    pub async fn metrics_snapshot(&self) -> Vec<(String, CircuitBreakerMetrics)> {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> =
            self.breakers.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect();
        let mut snapshot = Vec::with_capacity(breakers.len());
        for (name, breaker) in breakers {
            snapshot.push((name, breaker.metrics().await));
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_ms: 50,
            half_open_max_calls: 2,
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold_and_rejects_calls() {
        let cb = CircuitBreaker::new("llm", test_config());
        for _ in 0..3 {
            cb.before_call().await.expect("closed circuit allows calls");
            cb.record_failure().await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.before_call().await.is_err());
    }

    #[tokio::test]
    async fn transitions_through_half_open_back_to_closed_on_success() {
        let cb = CircuitBreaker::new("sms", test_config());
        for _ in 0..3 {
            cb.before_call().await.ok();
            cb.record_failure().await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        cb.before_call().await.expect("timeout elapsed, should allow a trial call");
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success().await;
        cb.before_call().await.expect("half-open allows more trial calls");
        cb.record_success().await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let cb = CircuitBreaker::new("notifications", test_config());
        for _ in 0..3 {
            cb.before_call().await.ok();
            cb.record_failure().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        cb.before_call().await.expect("should allow trial call");
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure().await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn metrics_track_totals_and_open_count() {
        let cb = CircuitBreaker::new("llm", test_config());
        cb.before_call().await.ok();
        cb.record_success().await;
        for _ in 0..3 {
            cb.before_call().await.ok();
            cb.record_failure().await;
        }
        let metrics = cb.metrics().await;
        assert_eq!(metrics.total_calls, 4);
        assert_eq!(metrics.total_successes, 1);
        assert_eq!(metrics.total_failures, 3);
        assert_eq!(metrics.open_count, 1);
        assert!((metrics.failure_rate - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn latency_ring_recomputes_mean_and_evicts_oldest_past_capacity() {
        let cb = CircuitBreaker::new("llm", test_config());
        for latency in [10, 20, 30] {
            cb.record_latency(latency).await;
        }
        let metrics = cb.metrics().await;
        assert_eq!(metrics.latency_samples.len(), 3);
        assert!((metrics.mean_latency_ms - 20.0).abs() < 1e-9);

        for latency in 0..120u64 {
            cb.record_latency(latency).await;
        }
        let metrics = cb.metrics().await;
        assert_eq!(metrics.latency_samples.len(), LATENCY_RING_LEN);
        assert_eq!(metrics.latency_samples.first().copied(), Some(20));
    }

    #[tokio::test]
    async fn registry_reuses_breaker_per_name() {
        let registry = CircuitBreakerRegistry::new(test_config());
        let a = registry.get_or_create("llm");
        let b = registry.get_or_create("llm");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
