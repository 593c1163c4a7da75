//! Builder composing the client stages into one channel.
//!
//! Stage order, outermost first: Timeout → Retry → CircuitBreaker →
//! transport. The deadline is stamped before the retry layer so every
//! attempt shares one deadline, and the breaker sits innermost so it
//! observes each transport attempt individually.

use crate::breaker_stage::CircuitBreakerStage;
use crate::call::{BoxCall, CallOptions, Channel};
use crate::circuit_breaker::CircuitState;
use crate::clock::{Clock, MonotonicClock};
use crate::policy::PolicyProvider;
use crate::retry_stage::RetryStage;
use crate::scheduler::RetryScheduler;
use crate::timeout_stage::TimeoutStage;
use std::sync::Arc;
use std::time::Duration;

/// A transport channel wrapped with the full client stack.
pub struct ClientStack<C> {
    channel: TimeoutStage<RetryStage<CircuitBreakerStage<C>>>,
    scheduler: Arc<RetryScheduler>,
}

impl<C> ClientStack<C> {
    pub fn builder(provider: Arc<dyn PolicyProvider>) -> ClientStackBuilder {
        ClientStackBuilder::new(provider)
    }

    /// Current state of every circuit breaker created so far, sorted by
    /// method name.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.channel.inner().inner().breaker_states()
    }

    /// Stops the retry scheduler. Pending backoffs are dropped; calls that
    /// attempt to schedule a retry afterwards fail with their last status.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl<C, Req, Resp> Channel<Req, Resp> for ClientStack<C>
where
    C: Channel<Req, Resp> + 'static,
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn new_call(&self, method: &str, options: CallOptions) -> BoxCall<Req, Resp> {
        self.channel.new_call(method, options)
    }
}

/// Configures and assembles a [`ClientStack`].
pub struct ClientStackBuilder {
    provider: Arc<dyn PolicyProvider>,
    default_timeout: Duration,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<RetryScheduler>>,
}

impl ClientStackBuilder {
    pub fn new(provider: Arc<dyn PolicyProvider>) -> Self {
        Self {
            provider,
            default_timeout: Duration::ZERO,
            clock: Arc::new(MonotonicClock::default()),
            scheduler: None,
        }
    }

    /// Deadline applied to calls without one. Zero leaves calls unbounded.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Clock used by the circuit breakers.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shares one scheduler across several stacks instead of spawning a
    /// dedicated worker thread per stack.
    pub fn scheduler(mut self, scheduler: Arc<RetryScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build<C>(self, transport: C) -> ClientStack<C> {
        let scheduler = self.scheduler.unwrap_or_else(|| Arc::new(RetryScheduler::new()));
        let breakers = CircuitBreakerStage::with_clock(transport, self.provider.clone(), self.clock);
        let retries = RetryStage::new(breakers, self.provider.clone(), scheduler.clone());
        let channel = TimeoutStage::new(retries, self.provider, self.default_timeout);
        ClientStack { channel, scheduler }
    }
}
