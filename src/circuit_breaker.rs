//! Per-endpoint circuit breaker.
//!
//! ```text
//! Closed   → Open      failure_count >= failure_threshold
//! Open     → HalfOpen  first should_allow_request() after timeout since last failure
//! HalfOpen → Closed    record_success()
//! HalfOpen → Open      record_failure() (timeout restarts)
//! ```
//!
//! The breaker never runs the protected operation; callers report outcomes
//! through [`CircuitBreaker::record_success`] and [`CircuitBreaker::record_failure`].
//! Half-open does not cap probes: every caller that asks while half-open is
//! allowed through until the first outcome is reported.

use crate::clock::{default_clock, SharedClock};
use crate::error::ConfigError;
use crate::registry::Reclaim;
use crate::telemetry::{CircuitBreakerEvent, NullSink, SharedObserver, ThrottleEvent};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the timeout elapses.
    Open,
    /// Probe mode: calls pass until an outcome is reported.
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name used in logs and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated configuration for a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: failure_threshold });
        }
        if timeout_seconds == 0 {
            return Err(ConfigError::InvalidTimeout { provided: timeout_seconds });
        }
        Ok(Self { failure_threshold, timeout: Duration::from_secs(timeout_seconds) })
    }

    /// Failures needed to open from Closed.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// How long to stay Open after the last failure.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<f64>,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    /// Current state; reading it never triggers the Open → HalfOpen transition.
    pub state: CircuitState,
    /// Failures since the last success or close.
    pub failure_count: u32,
    /// Seconds since the most recent failure, if any was recorded.
    pub seconds_since_last_failure: Option<f64>,
}

/// Fault-isolation state machine for one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: SharedClock,
    observer: SharedObserver,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// # Examples
    /// ```
    /// use turnstile::{CircuitBreaker, CircuitBreakerConfig};
    /// let breaker = CircuitBreaker::new("/search", CircuitBreakerConfig::new(3, 30).unwrap());
    /// assert!(breaker.should_allow_request());
    /// ```
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_parts(name, config, default_clock(), Arc::new(NullSink))
    }

    pub(crate) fn with_parts(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
        observer: SharedObserver,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
            clock,
            observer,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Endpoint this breaker protects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Whether a request may pass. Performs the Open → HalfOpen transition
    /// once the timeout has elapsed.
    pub fn should_allow_request(&self) -> bool {
        let mut transitioned = false;
        let allowed = {
            let mut guard = self.lock();
            match guard.state {
                CircuitState::Closed | CircuitState::HalfOpen => true,
                CircuitState::Open => {
                    if self.timed_out(&guard) {
                        guard.state = CircuitState::HalfOpen;
                        transitioned = true;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if transitioned {
            tracing::info!(target: "turnstile::circuit_breaker", endpoint = %self.name, "Circuit breaker → half-open");
            self.emit(CircuitBreakerEvent::HalfOpen);
        }
        allowed
    }

    /// Report a successful protected operation.
    ///
    /// Resets the failure count. Closes a half-open breaker; an open breaker
    /// stays open until a probe succeeds.
    pub fn record_success(&self) {
        let closed = {
            let mut guard = self.lock();
            guard.failure_count = 0;
            if guard.state == CircuitState::HalfOpen {
                guard.state = CircuitState::Closed;
                true
            } else {
                false
            }
        };
        if closed {
            tracing::info!(target: "turnstile::circuit_breaker", endpoint = %self.name, "Circuit breaker → closed");
            self.emit(CircuitBreakerEvent::Closed);
        }
    }

    /// Report a failed protected operation.
    pub fn record_failure(&self) {
        let opened = {
            let mut guard = self.lock();
            guard.failure_count = guard.failure_count.saturating_add(1);
            guard.last_failure = Some(self.clock.now_secs());
            match guard.state {
                CircuitState::HalfOpen => {
                    guard.state = CircuitState::Open;
                    tracing::warn!(
                        target: "turnstile::circuit_breaker",
                        endpoint = %self.name,
                        failures = guard.failure_count,
                        "Circuit breaker: probe failed → open"
                    );
                    Some(guard.failure_count)
                }
                CircuitState::Closed if guard.failure_count >= self.config.failure_threshold => {
                    guard.state = CircuitState::Open;
                    tracing::error!(
                        target: "turnstile::circuit_breaker",
                        endpoint = %self.name,
                        failures = guard.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                    Some(guard.failure_count)
                }
                _ => None,
            }
        };
        if let Some(failure_count) = opened {
            self.emit(CircuitBreakerEvent::Opened { failure_count });
        }
    }

    /// Force the breaker closed, clearing failure history.
    pub fn reset(&self) {
        let was_closed = {
            let mut guard = self.lock();
            let was_closed = guard.state == CircuitState::Closed;
            guard.state = CircuitState::Closed;
            guard.failure_count = 0;
            guard.last_failure = None;
            was_closed
        };
        if !was_closed {
            tracing::info!(target: "turnstile::circuit_breaker", endpoint = %self.name, "Circuit breaker reset → closed");
            self.emit(CircuitBreakerEvent::Closed);
        }
    }

    /// Current state without attempting any transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures since the last success or close.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Seconds until an open breaker will admit a probe; zero otherwise.
    pub fn remaining_open_time(&self) -> f64 {
        let guard = self.lock();
        if guard.state != CircuitState::Open {
            return 0.0;
        }
        let elapsed = self.elapsed_since_failure(&guard).unwrap_or(f64::MAX);
        (self.config.timeout.as_secs_f64() - elapsed).max(0.0)
    }

    /// Read-only view for statistics.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let guard = self.lock();
        CircuitSnapshot {
            state: guard.state,
            failure_count: guard.failure_count,
            seconds_since_last_failure: self.elapsed_since_failure(&guard),
        }
    }

    fn timed_out(&self, state: &BreakerState) -> bool {
        match self.elapsed_since_failure(state) {
            Some(elapsed) => elapsed >= self.config.timeout.as_secs_f64(),
            None => true,
        }
    }

    fn elapsed_since_failure(&self, state: &BreakerState) -> Option<f64> {
        state.last_failure.map(|at| (self.clock.now_secs() - at).max(0.0))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CircuitBreakerEvent) {
        self.observer.observe(&ThrottleEvent::CircuitBreaker { endpoint: self.name.clone(), event });
    }
}

impl Reclaim for CircuitBreaker {
    /// Only a closed breaker with no recorded failures may be forgotten.
    fn at_rest(&self) -> bool {
        let guard = self.lock();
        guard.state == CircuitState::Closed && guard.failure_count == 0
    }
}
