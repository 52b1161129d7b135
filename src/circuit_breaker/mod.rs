//! Circuit breaker (C3): a state machine wrapping a call to suppress traffic
//! after repeated failures (spec.md §4.3).

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, SpiralError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_half_open_successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
}

/// Generic circuit breaker. Independent of what it guards — `call` takes any
/// async fallible closure.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitState>>,
    consecutive_failures: AtomicU32,
    consecutive_half_open_successes: AtomicU32,
    half_open_calls: AtomicU32,
    opened_at: Arc<RwLock<Instant>>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: AtomicU32::new(0),
            consecutive_half_open_successes: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            opened_at: Arc::new(RwLock::new(Instant::now())),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open().await;
        *self.state.read().await
    }

    async fn maybe_transition_to_half_open(&self) {
        let current = *self.state.read().await;
        if current != CircuitState::Open {
            return;
        }
        let opened_at = *self.opened_at.read().await;
        if opened_at.elapsed() >= self.config.timeout {
            let mut state = self.state.write().await;
            if *state == CircuitState::Open {
                *state = CircuitState::HalfOpen;
                self.consecutive_half_open_successes
                    .store(0, Ordering::SeqCst);
                self.half_open_calls.store(0, Ordering::SeqCst);
                info!(breaker = %self.name, "circuit breaker half-open");
            }
        }
    }

    /// Run `f`. If the circuit is open, `f` is never invoked: `fallback` runs
    /// if supplied, else a `CircuitOpen` error is returned.
    pub async fn call<T, Fut, FFut>(
        &self,
        f: impl FnOnce() -> Fut,
        fallback: Option<impl FnOnce() -> FFut>,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        FFut: Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.maybe_transition_to_half_open().await;

        let current = *self.state.read().await;
        if current == CircuitState::Open {
            return match fallback {
                Some(fallback) => fallback().await,
                None => Err(SpiralError::CircuitOpen),
            };
        }

        match f().await {
            Ok(value) => {
                self.record_success(current).await;
                Ok(value)
            }
            Err(e) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                self.record_failure(current).await;
                Err(e)
            }
        }
    }

    async fn record_success(&self, state: CircuitState) {
        match state {
            CircuitState::HalfOpen => {
                let count = self
                    .consecutive_half_open_successes
                    .fetch_add(1, Ordering::SeqCst)
                    + 1;
                if count >= self.config.success_threshold {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self, state: CircuitState) {
        match state {
            CircuitState::Closed => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    breaker = %self.name,
                    count, threshold = self.config.failure_threshold,
                    "circuit breaker failure"
                );
                if count >= self.config.failure_threshold {
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                let calls = self.half_open_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if calls >= self.config.half_open_max_calls {
                    self.transition_to_open().await;
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn transition_to_open(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Open;
        *self.opened_at.write().await = Instant::now();
        self.consecutive_half_open_successes
            .store(0, Ordering::SeqCst);
        warn!(breaker = %self.name, "circuit breaker opened");
    }

    async fn transition_to_closed(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_half_open_successes
            .store(0, Ordering::SeqCst);
        info!(breaker = %self.name, "circuit breaker closed");
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state().await,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            consecutive_half_open_successes: self
                .consecutive_half_open_successes
                .load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}
