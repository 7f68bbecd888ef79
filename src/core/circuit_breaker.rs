//! Per-destination circuit breaker
//!
//! Isolates a failing worker endpoint so it does not consume queue
//! concurrency slots or retry budget on calls that are almost certain to
//! fail. State checks are lock-free atomics; transitions use compare-and-swap
//! so unrelated destinations are never serialized against each other.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tracing::info;

use crate::{
    config::CircuitBreakerConfig,
    core::error::{DispatchError, DispatchResult},
};

/// Circuit breaker state constants for atomic storage
const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,
    /// Circuit is open - requests are rejected
    Open,
    /// Testing if the destination has recovered - limited requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn to_int(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_int(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Monotonic milliseconds since an arbitrary process-local epoch, suitable
/// for atomic storage.
#[inline]
fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Circuit breaker for a single destination key
#[derive(Debug)]
pub struct CircuitBreaker {
    /// State stored as atomic u8 (0=Closed, 1=Open, 2=HalfOpen)
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    last_failure_time_ms: AtomicU64,
    last_state_change_ms: AtomicU64,
    config: CircuitBreakerConfig,
    key: String,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            last_failure_time_ms: AtomicU64::new(0),
            last_state_change_ms: AtomicU64::new(now_ms()),
            config,
            key: key.into(),
        }
    }

    /// Destination key this breaker guards
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Check if a request may be executed (lock-free hot path).
    ///
    /// Half-open permits the trial calls needed to decide the transition.
    #[inline]
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        }
    }

    /// Current state, promoting Open to HalfOpen once the reset timeout has
    /// elapsed (lock-free, CAS on the transition).
    #[inline]
    pub fn state(&self) -> CircuitState {
        let current = CircuitState::from_int(self.state.load(Ordering::Acquire));

        if current == CircuitState::Open {
            let last_change_ms = self.last_state_change_ms.load(Ordering::Acquire);
            let elapsed_ms = now_ms().saturating_sub(last_change_ms);
            let timeout_ms = self.config.reset_timeout_secs * 1000;

            if elapsed_ms >= timeout_ms {
                if self
                    .state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.last_state_change_ms.store(now_ms(), Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.consecutive_successes.store(0, Ordering::Release);
                    info!(key = %self.key, "Circuit breaker state transition: open -> half_open");
                    return CircuitState::HalfOpen;
                }
                // Another thread already transitioned, re-read
                return CircuitState::from_int(self.state.load(Ordering::Acquire));
            }
        }
        current
    }

    /// Record the outcome of a request to this destination
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;

        if CircuitState::from_int(self.state.load(Ordering::Acquire)) == CircuitState::HalfOpen
            && successes >= self.config.success_threshold
        {
            self.transition_to(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_time_ms.store(now_ms(), Ordering::Release);

        match CircuitState::from_int(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old_state = CircuitState::from_int(self.state.swap(new_state.to_int(), Ordering::AcqRel));

        if old_state != new_state {
            self.last_state_change_ms.store(now_ms(), Ordering::Release);
            match new_state {
                CircuitState::Closed | CircuitState::HalfOpen => {
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.consecutive_successes.store(0, Ordering::Release);
                }
                CircuitState::Open => {
                    self.consecutive_successes.store(0, Ordering::Release);
                }
            }
            info!(
                key = %self.key,
                "Circuit breaker state transition: {} -> {}",
                old_state,
                new_state
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Acquire)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }

    /// Time since the last recorded failure, if any
    pub fn time_since_last_failure(&self) -> Option<Duration> {
        let last_ms = self.last_failure_time_ms.load(Ordering::Acquire);
        if last_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(now_ms().saturating_sub(last_ms)))
        }
    }

    /// Reset to closed state (manual operator override)
    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
    }

    /// Force the circuit open (manual operator override)
    pub fn force_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            consecutive_successes: self.consecutive_successes(),
            total_failures: self.total_failures(),
            total_successes: self.total_successes(),
        }
    }
}

/// Point-in-time breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// Registry of circuit breakers keyed by destination.
///
/// Breakers are created lazily on first use and persist for process lifetime
/// unless explicitly reset. Per-key state lives in the breaker's own atomics,
/// so concurrent calls on unrelated keys never contend.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or lazily create the breaker for a destination key
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(&existing);
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    /// Execute an operation guarded by the breaker for `key`.
    ///
    /// When the circuit is open and the reset timeout has not elapsed, this
    /// fails fast with `CircuitOpen` without invoking the operation and
    /// without counting a new failure. Otherwise the operation runs and its
    /// outcome is recorded.
    pub async fn execute<T, F, Fut>(&self, key: &str, operation: F) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        let breaker = self.breaker(key);
        if !breaker.can_execute() {
            return Err(DispatchError::CircuitOpen {
                key: key.to_string(),
            });
        }

        let result = operation().await;
        breaker.record_outcome(result.is_ok());
        result
    }

    /// Current state for a key; `None` if no call has touched the key yet
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    /// Manually reset one breaker to closed
    pub fn reset(&self, key: &str) {
        if let Some(breaker) = self.breakers.get(key) {
            breaker.reset();
        }
    }

    /// Force a breaker open, creating it if needed (operator override, e.g.
    /// to drain a destination before maintenance)
    pub fn force_open(&self, key: &str) {
        self.breaker(key).force_open();
    }

    /// Snapshot of all breakers for status export
    pub fn stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }
}
