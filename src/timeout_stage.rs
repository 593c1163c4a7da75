//! Channel decorator that stamps a default deadline onto outbound calls.
//!
//! A caller-supplied deadline always wins: this stage never shortens or
//! overrides it. Otherwise the per-method timeout from the policy provider
//! applies, falling back to the stage's configured default. A zero resolved
//! timeout disables deadline stamping for that method.

use crate::call::{BoxCall, CallOptions, Channel};
use crate::policy::PolicyProvider;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline-stamping channel decorator.
pub struct TimeoutStage<C> {
    inner: C,
    provider: Arc<dyn PolicyProvider>,
    default_timeout: Duration,
}

impl<C> TimeoutStage<C> {
    pub fn new(inner: C, provider: Arc<dyn PolicyProvider>, default_timeout: Duration) -> Self {
        Self { inner, provider, default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub(crate) fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C, Req, Resp> Channel<Req, Resp> for TimeoutStage<C>
where
    C: Channel<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn new_call(&self, method: &str, mut options: CallOptions) -> BoxCall<Req, Resp> {
        if options.deadline().is_none() {
            let timeout = self.provider.timeout(method).unwrap_or(self.default_timeout);
            if !timeout.is_zero() {
                tracing::trace!(method, ?timeout, "applying default deadline");
                options.set_deadline(Instant::now() + timeout);
            }
        }
        self.inner.new_call(method, options)
    }
}
