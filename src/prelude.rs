//! Convenient re-exports for common Callguard types.
pub use crate::{
    breaker_stage::{CircuitBreakerStage, CIRCUIT_OPEN_MESSAGE},
    call::{BoxCall, CallListener, CallOptions, Channel, ClientCall},
    circuit_breaker::{CircuitBreaker, CircuitState},
    clock::{Clock, MonotonicClock},
    policy::{
        CircuitBreakerPolicy, PolicyError, PolicyProvider, RetryPolicy, RetryPolicyBuilder,
        StaticPolicies,
    },
    retry_stage::RetryStage,
    scheduler::{RetryScheduler, SchedulerClosed},
    stack::{ClientStack, ClientStackBuilder},
    status::{Metadata, RpcStatus, StatusCode},
    timeout_stage::TimeoutStage,
};
