//! Circuit breaker pattern for hostile targets.
//!
//! Caps total request volume against a target that keeps failing (rate
//! limiting, CAPTCHA walls, outages), independent of any single
//! operation's retry budget.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N consecutive failures]--> OPEN (rejecting) --[reopen_at]--> HALF_OPEN (probing)
//!                                                  ^                                  |
//!                                                  +---[any probe fails, longer wait]-+
//!                                                                                     |
//! CLOSED <------------------------[all probes succeed]--------------------------------+
//! ```
//!
//! Every phase change starts a new generation. A [`CircuitPermit`] only
//! reports into the generation that issued it, so a call admitted before
//! a trip cannot close or re-trip the circuit after it half-opens.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Budget;
use crate::error::CircuitOpenError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Calls admitted in half-open state; all must succeed to close the circuit.
    pub half_open_trials: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub open_duration: Duration,

    /// When a half-open probe fails, multiply the open duration by this factor.
    pub open_backoff_multiplier: f64,

    /// Maximum open duration after repeated probe failures.
    pub max_open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_trials: 2,
            open_duration: Duration::from_secs(60),
            open_backoff_multiplier: 2.0,
            max_open_duration: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_budget(budget: &Budget) -> Self {
        Self {
            failure_threshold: budget.failure_threshold,
            half_open_trials: budget.half_open_trials,
            open_duration: budget.open_duration,
            open_backoff_multiplier: budget.open_backoff_multiplier,
            max_open_duration: budget.max_open_duration,
        }
    }
}

/// Permission for one call, tied to the breaker phase that admitted it.
#[must_use = "report the call with record_success, record_failure or release"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPermit {
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { reopen_at: Instant },
    HalfOpen { admitted: u32, succeeded: u32 },
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    phase: Phase,
    generation: u64,
    last_error_message: Option<String>,
    current_open_duration: Duration,
    trips: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            phase: Phase::Closed { failures: 0 },
            generation: 0,
            last_error_message: None,
            current_open_duration: config.open_duration,
            trips: 0,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.generation += 1;
    }

    fn permit(&self) -> CircuitPermit {
        CircuitPermit {
            generation: self.generation,
        }
    }

    fn state(&self) -> CircuitState {
        match self.phase {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub trial_successes: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
    /// How many times the circuit has opened since creation.
    pub trips: u64,
}

/// Thread-safe circuit breaker guarding one target.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner, Instant::now());
        inner.state()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner, now);

        let (failure_count, trial_successes, time_until_half_open) = match inner.phase {
            Phase::Closed { failures } => (failures, 0, None),
            Phase::Open { reopen_at } => (0, 0, Some(reopen_at.saturating_duration_since(now))),
            Phase::HalfOpen { succeeded, .. } => (0, succeeded, None),
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state(),
            failure_count,
            trial_successes,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
            trips: inner.trips,
        }
    }

    /// Ask permission for one call.
    ///
    /// - Closed: always permitted
    /// - Open: rejected with the time left until the circuit half-opens
    /// - HalfOpen: permitted while trial slots remain, rejected otherwise
    ///
    /// Every permit must be handed back to exactly one of
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or [`release`](Self::release).
    pub fn acquire(&self) -> Result<CircuitPermit, CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner, now);
        let permit = inner.permit();

        match &mut inner.phase {
            Phase::Closed { .. } => Ok(permit),
            Phase::Open { reopen_at } => Err(CircuitOpenError {
                name: self.name.clone(),
                retry_after: reopen_at.saturating_duration_since(now),
            }),
            Phase::HalfOpen { admitted, .. } => {
                if *admitted < self.config.half_open_trials {
                    *admitted += 1;
                    Ok(permit)
                } else {
                    // Probes are still in flight; their outcome decides.
                    Err(CircuitOpenError {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, permit: CircuitPermit) {
        let mut inner = self.lock_inner();
        if !self.is_current(&inner, permit) {
            return;
        }

        match &mut inner.phase {
            Phase::HalfOpen { succeeded, .. } => {
                *succeeded += 1;
                if *succeeded >= self.config.half_open_trials {
                    let probes = *succeeded;
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        probes
                    );
                    inner.enter(Phase::Closed { failures: 0 });
                    inner.last_error_message = None;
                    inner.current_open_duration = self.config.open_duration;
                }
            }
            Phase::Closed { failures } => {
                *failures = 0;
            }
            // Open never admits, so no current permit can land here.
            Phase::Open { .. } => {}
        }
    }

    pub fn record_failure(&self, permit: CircuitPermit, reason: &str) {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        if !self.is_current(&inner, permit) {
            return;
        }
        inner.last_error_message = Some(reason.to_string());

        match inner.phase {
            Phase::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures,
                        error = %reason,
                        open_ms = %inner.current_open_duration.as_millis(),
                        "Circuit breaker opening after {} consecutive failures",
                        failures
                    );
                    self.trip(&mut inner, now);
                } else {
                    inner.phase = Phase::Closed { failures };
                }
            }
            Phase::HalfOpen { .. } => {
                inner.current_open_duration = std::cmp::min(
                    inner
                        .current_open_duration
                        .mul_f64(self.config.open_backoff_multiplier.max(1.0)),
                    self.config.max_open_duration,
                );
                tracing::warn!(
                    circuit = %self.name,
                    error = %reason,
                    open_ms = %inner.current_open_duration.as_millis(),
                    "Circuit breaker probe failed, returning to open state"
                );
                self.trip(&mut inner, now);
            }
            Phase::Open { .. } => {}
        }
    }

    /// Give back a permission that ended without an outcome (e.g. cancelled).
    pub fn release(&self, permit: CircuitPermit) {
        let mut inner = self.lock_inner();
        if !self.is_current(&inner, permit) {
            return;
        }
        if let Phase::HalfOpen { admitted, .. } = &mut inner.phase {
            *admitted = admitted.saturating_sub(1);
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.enter(Phase::Closed { failures: 0 });
        inner.last_error_message = None;
        inner.current_open_duration = self.config.open_duration;
    }

    fn trip(&self, inner: &mut CircuitBreakerInner, now: Instant) {
        let reopen_at = now + inner.current_open_duration;
        inner.enter(Phase::Open { reopen_at });
        inner.trips += 1;
    }

    /// Results from an earlier phase are dropped.
    fn is_current(&self, inner: &CircuitBreakerInner, permit: CircuitPermit) -> bool {
        if permit.generation == inner.generation {
            return true;
        }
        tracing::debug!(
            circuit = %self.name,
            state = %inner.state(),
            "Ignoring result of a call admitted in an earlier circuit phase"
        );
        false
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner, now: Instant) {
        if let Phase::Open { reopen_at } = inner.phase
            && now >= reopen_at
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.enter(Phase::HalfOpen {
                admitted: 0,
                succeeded: 0,
            });
        }
    }
}
