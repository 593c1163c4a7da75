//! Channel decorator that guards each method behind a circuit breaker.
//!
//! Breakers are created lazily on first use of a method and live for the
//! process lifetime; the registry is a lock-guarded map with double-checked
//! insertion so concurrent first calls to the same method share one breaker.
//! A rejected call never touches the transport: the caller observes a
//! synthetic `UNAVAILABLE("circuit breaker open")`, indistinguishable from a
//! transport-level response. Rejections are not counted as breaker failures.

use crate::call::{BoxCall, CallListener, CallOptions, Channel, ClientCall};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::policy::PolicyProvider;
use crate::status::{Metadata, RpcStatus};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Status description used for breaker rejections. Part of the caller-visible
/// contract; external code may match on it.
pub const CIRCUIT_OPEN_MESSAGE: &str = "circuit breaker open";

/// Circuit-breaking channel decorator.
pub struct CircuitBreakerStage<C> {
    inner: C,
    provider: Arc<dyn PolicyProvider>,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl<C> CircuitBreakerStage<C> {
    pub fn new(inner: C, provider: Arc<dyn PolicyProvider>) -> Self {
        Self::with_clock(inner, provider, Arc::new(MonotonicClock::default()))
    }

    /// Use an explicit clock for every breaker this stage creates.
    pub fn with_clock(inner: C, provider: Arc<dyn PolicyProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { inner, provider, clock, breakers: RwLock::new(HashMap::new()) }
    }

    /// Sorted snapshot of `(method, state)` for metrics collectors.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(method, breaker)| (method.clone(), breaker.current_state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// The breaker for `method`, if one has been created.
    pub fn breaker(&self, method: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.get(method).cloned()
    }

    fn get_or_create(&self, method: &str) -> Option<Arc<CircuitBreaker>> {
        if let Some(breaker) = self.breaker(method) {
            return Some(breaker);
        }
        let policy = self.provider.circuit_breaker(method)?;
        if !policy.enabled() {
            return None;
        }
        let mut map = self.breakers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Double-checked: another caller may have inserted while we upgraded.
        let breaker = map.entry(method.to_string()).or_insert_with(|| {
            tracing::debug!(method, "creating circuit breaker");
            Arc::new(CircuitBreaker::with_clock(method, policy, self.clock.clone()))
        });
        Some(breaker.clone())
    }
}

impl<C, Req, Resp> Channel<Req, Resp> for CircuitBreakerStage<C>
where
    C: Channel<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn new_call(&self, method: &str, options: CallOptions) -> BoxCall<Req, Resp> {
        let breaker = match self.get_or_create(method) {
            Some(breaker) => breaker,
            // No policy, or breaker disabled: forward unmodified.
            None => return self.inner.new_call(method, options),
        };

        if !breaker.allow_call() {
            tracing::warn!(method, "rejecting call, circuit breaker open");
            return Box::new(RejectedCall);
        }

        Box::new(ObservedCall { inner: self.inner.new_call(method, options), breaker })
    }
}

/// Synthetic call delivered when the breaker disallows a call.
///
/// `start` immediately closes with `UNAVAILABLE`; everything else is a no-op.
struct RejectedCall;

impl<Req, Resp> ClientCall<Req, Resp> for RejectedCall {
    fn start(&mut self, mut listener: Box<dyn CallListener<Resp>>, _headers: Metadata) {
        listener.on_close(RpcStatus::unavailable(CIRCUIT_OPEN_MESSAGE), Metadata::new());
    }

    fn request(&mut self, _count: u32) {}

    fn send_message(&mut self, _message: Req) {}

    fn half_close(&mut self) {}

    fn set_message_compression(&mut self, _enabled: bool) {}

    fn cancel(&mut self, _reason: &str) {}

    fn is_ready(&self) -> bool {
        false
    }
}

/// Forwarding call whose listener reports the terminal status to the breaker.
struct ObservedCall<Req, Resp> {
    inner: BoxCall<Req, Resp>,
    breaker: Arc<CircuitBreaker>,
}

impl<Req, Resp> ClientCall<Req, Resp> for ObservedCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn start(&mut self, listener: Box<dyn CallListener<Resp>>, headers: Metadata) {
        let observing = ObservingListener { inner: listener, breaker: self.breaker.clone() };
        self.inner.start(Box::new(observing), headers);
    }

    fn request(&mut self, count: u32) {
        self.inner.request(count);
    }

    fn send_message(&mut self, message: Req) {
        self.inner.send_message(message);
    }

    fn half_close(&mut self) {
        self.inner.half_close();
    }

    fn set_message_compression(&mut self, enabled: bool) {
        self.inner.set_message_compression(enabled);
    }

    fn cancel(&mut self, reason: &str) {
        self.inner.cancel(reason);
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

struct ObservingListener<Resp> {
    inner: Box<dyn CallListener<Resp>>,
    breaker: Arc<CircuitBreaker>,
}

impl<Resp> CallListener<Resp> for ObservingListener<Resp>
where
    Resp: Send + 'static,
{
    fn on_headers(&mut self, headers: Metadata) {
        self.inner.on_headers(headers);
    }

    fn on_message(&mut self, message: Resp) {
        self.inner.on_message(message);
    }

    fn on_close(&mut self, status: RpcStatus, trailers: Metadata) {
        if status.is_ok() || !self.breaker.policy().is_failure(status.code()) {
            self.breaker.on_success();
        } else {
            self.breaker.on_failure(&status);
        }
        self.inner.on_close(status, trailers);
    }
}
