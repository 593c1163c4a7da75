#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Callguard
//!
//! Client-side resilience middleware for callback-style RPC channels:
//! per-method circuit breakers, transparent retries with exponential
//! backoff, and default deadline enforcement.
//!
//! Each feature is a channel decorator; [`ClientStack`] composes them in
//! the order Timeout → Retry → CircuitBreaker → transport, so deadlines
//! cover all attempts of a call while the breaker sees every individual
//! transport attempt.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use callguard::{CallOptions, Channel, CircuitBreakerPolicy, ClientStack,
//!     RetryPolicy, StaticPolicies};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let policies = Arc::new(
//!     StaticPolicies::new()
//!         .with_circuit_breaker(
//!             "inventory.Inventory/Get",
//!             CircuitBreakerPolicy::new(5, Duration::from_secs(30))?,
//!         )
//!         .with_retry("inventory.Inventory/Get", RetryPolicy::builder().build()?),
//! );
//!
//! let stack = ClientStack::builder(policies)
//!     .default_timeout(Duration::from_secs(10))
//!     .build(transport);
//!
//! let call = stack.new_call("inventory.Inventory/Get", CallOptions::new());
//! ```

pub mod breaker_stage;
pub mod call;
pub mod circuit_breaker;
pub mod clock;
pub mod policy;
pub mod prelude;
pub mod retry_stage;
pub mod scheduler;
pub mod stack;
pub mod status;
pub mod timeout_stage;

// Re-exports
pub use breaker_stage::{CircuitBreakerStage, CIRCUIT_OPEN_MESSAGE};
pub use call::{BoxCall, CallListener, CallOptions, Channel, ClientCall};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use policy::{
    CircuitBreakerPolicy, PolicyError, PolicyProvider, RetryPolicy, RetryPolicyBuilder,
    StaticPolicies,
};
pub use retry_stage::RetryStage;
pub use scheduler::{RetryScheduler, SchedulerClosed};
pub use stack::{ClientStack, ClientStackBuilder};
pub use status::{Metadata, RpcStatus, StatusCode};
pub use timeout_stage::TimeoutStage;
