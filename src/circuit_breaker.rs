//! Per-method circuit breaker state machine.
//!
//! One breaker guards one RPC method and is shared by every concurrent call
//! to that method. All state lives behind a single mutex per breaker; the
//! critical sections are a handful of integer comparisons, and different
//! methods never contend on a shared lock.
//!
//! Transitions happen only through [`CircuitBreaker::allow_call`],
//! [`CircuitBreaker::on_success`], and [`CircuitBreaker::on_failure`], plus
//! the passage of time observed through the injected [`Clock`].

use crate::clock::{Clock, MonotonicClock};
use crate::policy::CircuitBreakerPolicy;
use crate::status::RpcStatus;
use std::sync::{Arc, Mutex};

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open interval elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// State name for observability surfaces.
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Consecutive qualifying failures observed while Closed.
    failure_count: u32,
    /// Clock millis at which the Open interval ends.
    open_until: u64,
    /// Probes currently outstanding; only non-zero while HalfOpen.
    half_open_in_flight: u32,
}

/// Thread-safe breaker for a single RPC method.
#[derive(Debug)]
pub struct CircuitBreaker {
    method: String,
    policy: CircuitBreakerPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for `method` governed by `policy`.
    pub fn new(method: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self::with_clock(method, policy, Arc::new(MonotonicClock::default()))
    }

    /// Create a breaker with an explicit clock (useful for deterministic tests).
    pub fn with_clock(
        method: impl Into<String>,
        policy: CircuitBreakerPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            method: method.into(),
            policy,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                open_until: 0,
                half_open_in_flight: 0,
            }),
        }
    }

    /// The policy governing this breaker.
    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    /// The method this breaker guards.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// May a call proceed right now?
    ///
    /// Closed always admits. Open admits nothing until the open interval
    /// elapses, then transitions to HalfOpen and competes for a probe slot.
    /// HalfOpen admits up to `half_open_max_calls` concurrent probes.
    pub fn allow_call(&self) -> bool {
        if !self.policy.enabled() {
            return true;
        }
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.clock.now_millis() < inner.open_until {
                    false
                } else {
                    inner.state = CircuitState::HalfOpen;
                    inner.failure_count = 0;
                    inner.half_open_in_flight = 0;
                    tracing::info!(method = %self.method, "circuit breaker half-open");
                    Self::try_acquire_probe(&mut inner, self.policy.half_open_max_calls())
                }
            }
            CircuitState::HalfOpen => {
                Self::try_acquire_probe(&mut inner, self.policy.half_open_max_calls())
            }
        }
    }

    /// Record a successful terminal outcome.
    pub fn on_success(&self) {
        if !self.policy.enabled() {
            return;
        }
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                // A single probe success fully closes the breaker.
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.open_until = 0;
                inner.half_open_in_flight = 0;
                tracing::info!(method = %self.method, "circuit breaker closed");
            }
            // A success for a call admitted before the breaker opened must
            // not resurrect state.
            CircuitState::Open => {}
        }
    }

    /// Record a failed terminal outcome. Codes outside the policy's failure
    /// set are ignored.
    pub fn on_failure(&self, status: &RpcStatus) {
        if !self.policy.enabled() || !self.policy.is_failure(status.code()) {
            return;
        }
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.policy.max_failures() {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, queryable without mutating (observability hook).
    pub fn current_state(&self) -> CircuitState {
        self.lock().state
    }

    fn try_acquire_probe(inner: &mut BreakerInner, max_calls: u32) -> bool {
        if inner.half_open_in_flight < max_calls {
            inner.half_open_in_flight += 1;
            true
        } else {
            false
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        let failures = inner.failure_count;
        inner.state = CircuitState::Open;
        inner.failure_count = 0;
        inner.half_open_in_flight = 0;
        inner.open_until = self
            .clock
            .now_millis()
            .saturating_add(duration_millis(self.policy.open_duration()));
        tracing::warn!(
            method = %self.method,
            failures,
            open_for = ?self.policy.open_duration(),
            "circuit breaker open"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Poisoning only happens if a panic escaped a critical section above;
        // the state is a plain integer record, safe to keep using.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn duration_millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
