//! Per-method resilience policies and the lookup seam that supplies them.
//!
//! Policies are immutable, validated at construction, and cheap to clone.
//! The embedding application implements [`PolicyProvider`] (or uses
//! [`StaticPolicies`]) to map an RPC method name to the policies that apply;
//! a method with no policy passes through the corresponding stage unchanged.

use crate::status::StatusCode;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Errors produced when validating policy configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    /// `max_failures` must be > 0.
    #[error("max_failures must be > 0 (got {0})")]
    InvalidMaxFailures(u32),
    /// `open_duration` must be > 0 for an enabled breaker.
    #[error("open_duration must be > 0 for an enabled breaker (got {0:?})")]
    InvalidOpenDuration(Duration),
    /// `half_open_max_calls` must be > 0.
    #[error("half_open_max_calls must be > 0 (got {0})")]
    InvalidHalfOpenLimit(u32),
    /// `max_attempts` must be > 0 (it counts the first try).
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(u32),
    /// `multiplier` must be >= 1.0 and finite.
    #[error("backoff multiplier must be >= 1.0 and finite (got {0})")]
    InvalidMultiplier(f64),
    /// `max_backoff` must be >= `initial_backoff`.
    #[error("max_backoff ({max:?}) must be >= initial_backoff ({initial:?})")]
    MaxBackoffBelowInitial { initial: Duration, max: Duration },
}

/// Validated circuit breaker configuration for one RPC method.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    enabled: bool,
    max_failures: u32,
    open_duration: Duration,
    half_open_max_calls: u32,
    failure_codes: HashSet<StatusCode>,
}

impl CircuitBreakerPolicy {
    /// Create an enabled policy: `max_failures` consecutive qualifying
    /// failures open the breaker for `open_duration`.
    ///
    /// Defaults: one half-open probe at a time; `UNAVAILABLE` and
    /// `DEADLINE_EXCEEDED` count as failures.
    pub fn new(max_failures: u32, open_duration: Duration) -> Result<Self, PolicyError> {
        if max_failures == 0 {
            return Err(PolicyError::InvalidMaxFailures(0));
        }
        if open_duration.is_zero() {
            return Err(PolicyError::InvalidOpenDuration(open_duration));
        }
        Ok(Self {
            enabled: true,
            max_failures,
            open_duration,
            half_open_max_calls: 1,
            failure_codes: HashSet::from([StatusCode::Unavailable, StatusCode::DeadlineExceeded]),
        })
    }

    /// A disabled policy: the breaker is a no-op and never rejects a call.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_failures: u32::MAX,
            open_duration: Duration::MAX,
            half_open_max_calls: u32::MAX,
            failure_codes: HashSet::new(),
        }
    }

    /// Override the maximum number of concurrent half-open probes; must be > 0.
    pub fn with_half_open_limit(mut self, limit: u32) -> Result<Self, PolicyError> {
        if limit == 0 {
            return Err(PolicyError::InvalidHalfOpenLimit(0));
        }
        self.half_open_max_calls = limit;
        Ok(self)
    }

    /// Replace the set of status codes that count as breaker failures.
    pub fn with_failure_codes(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.failure_codes = codes.into_iter().collect();
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn open_duration(&self) -> Duration {
        self.open_duration
    }

    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls
    }

    /// Whether a terminal code counts against the breaker.
    pub fn is_failure(&self, code: StatusCode) -> bool {
        self.failure_codes.contains(&code)
    }
}

/// Validated retry configuration for one RPC method.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    retryable_codes: HashSet<StatusCode>,
}

impl RetryPolicy {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Whether a terminal code is eligible for automatic retry.
    pub fn is_retryable(&self, code: StatusCode) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// Delay before retry `n` (1-indexed: the first retry uses `n = 1`):
    /// `min(initial * multiplier^(n-1), max)`, floored at one millisecond.
    pub fn backoff_for_retry(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
        } else {
            self.max_backoff
        };
        capped.max(Duration::from_millis(1))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    retryable_codes: HashSet<StatusCode>,
}

impl RetryPolicyBuilder {
    /// Create a builder with sane defaults: 3 attempts, 100ms initial
    /// backoff doubling up to 10s, retrying `UNAVAILABLE` only.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            retryable_codes: HashSet::from([StatusCode::Unavailable]),
        }
    }

    /// Total attempts including the first try. Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Per-retry growth factor. Must be >= 1.0.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Replace the set of retryable status codes.
    pub fn retry_on(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.retryable_codes = codes.into_iter().collect();
        self
    }

    /// Build the policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::InvalidMaxAttempts(0));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(self.multiplier));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(PolicyError::MaxBackoffBelowInitial {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            multiplier: self.multiplier,
            retryable_codes: self.retryable_codes,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an RPC method name to the resilience policies that apply to it.
///
/// Absence of a policy means "pass through unmodified" for that stage.
pub trait PolicyProvider: Send + Sync {
    fn circuit_breaker(&self, method: &str) -> Option<CircuitBreakerPolicy> {
        let _ = method;
        None
    }

    fn retry(&self, method: &str) -> Option<RetryPolicy> {
        let _ = method;
        None
    }

    fn timeout(&self, method: &str) -> Option<Duration> {
        let _ = method;
        None
    }
}

/// Map-backed provider for statically configured applications.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicies {
    breakers: HashMap<String, CircuitBreakerPolicy>,
    retries: HashMap<String, RetryPolicy>,
    timeouts: HashMap<String, Duration>,
}

impl StaticPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_circuit_breaker(
        mut self,
        method: impl Into<String>,
        policy: CircuitBreakerPolicy,
    ) -> Self {
        self.breakers.insert(method.into(), policy);
        self
    }

    pub fn with_retry(mut self, method: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retries.insert(method.into(), policy);
        self
    }

    pub fn with_timeout(mut self, method: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts.insert(method.into(), timeout);
        self
    }
}

impl PolicyProvider for StaticPolicies {
    fn circuit_breaker(&self, method: &str) -> Option<CircuitBreakerPolicy> {
        self.breakers.get(method).cloned()
    }

    fn retry(&self, method: &str) -> Option<RetryPolicy> {
        self.retries.get(method).cloned()
    }

    fn timeout(&self, method: &str) -> Option<Duration> {
        self.timeouts.get(method).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_rejects_zero_max_failures() {
        let err = CircuitBreakerPolicy::new(0, Duration::from_secs(1))
            .expect_err("zero failures should be invalid");
        assert_eq!(err, PolicyError::InvalidMaxFailures(0));
    }

    #[test]
    fn breaker_rejects_zero_open_duration() {
        let err = CircuitBreakerPolicy::new(3, Duration::ZERO)
            .expect_err("zero open duration should be invalid");
        assert_eq!(err, PolicyError::InvalidOpenDuration(Duration::ZERO));
    }

    #[test]
    fn breaker_rejects_zero_half_open_limit() {
        let err = CircuitBreakerPolicy::new(3, Duration::from_secs(1))
            .and_then(|p| p.with_half_open_limit(0))
            .expect_err("zero half-open limit should be invalid");
        assert_eq!(err, PolicyError::InvalidHalfOpenLimit(0));
    }

    #[test]
    fn disabled_breaker_matches_no_codes() {
        let policy = CircuitBreakerPolicy::disabled();
        assert!(!policy.enabled());
        assert!(!policy.is_failure(StatusCode::Unavailable));
    }

    #[test]
    fn default_failure_codes_are_conservative() {
        let policy = CircuitBreakerPolicy::new(3, Duration::from_secs(1)).unwrap();
        assert!(policy.is_failure(StatusCode::Unavailable));
        assert!(policy.is_failure(StatusCode::DeadlineExceeded));
        assert!(!policy.is_failure(StatusCode::InvalidArgument));
        assert!(!policy.is_failure(StatusCode::Ok));
    }

    #[test]
    fn retry_builder_rejects_zero_attempts() {
        let err = RetryPolicy::builder().max_attempts(0).build();
        assert_eq!(err, Err(PolicyError::InvalidMaxAttempts(0)));
    }

    #[test]
    fn retry_builder_rejects_sub_one_multiplier() {
        let err = RetryPolicy::builder().multiplier(0.5).build();
        assert!(matches!(err, Err(PolicyError::InvalidMultiplier(_))));
    }

    #[test]
    fn retry_builder_rejects_max_below_initial() {
        let err = RetryPolicy::builder()
            .initial_backoff(Duration::from_secs(5))
            .max_backoff(Duration::from_secs(1))
            .build();
        assert!(matches!(err, Err(PolicyError::MaxBackoffBelowInitial { .. })));
    }

    #[test]
    fn backoff_follows_exponential_sequence_with_cap() {
        let policy = RetryPolicy::builder()
            .max_attempts(10)
            .initial_backoff(Duration::from_millis(100))
            .multiplier(2.0)
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap();

        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_retry(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_retry(5), Duration::from_secs(1)); // capped
        assert_eq!(policy.backoff_for_retry(6), Duration::from_secs(1)); // still capped
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let policy = RetryPolicy::builder()
            .initial_backoff(Duration::from_millis(7))
            .multiplier(1.6)
            .max_backoff(Duration::from_secs(2))
            .build()
            .unwrap();

        let mut previous = Duration::ZERO;
        for n in 1..32 {
            let delay = policy.backoff_for_retry(n);
            assert!(delay >= previous, "delay shrank at retry {n}");
            assert!(delay <= Duration::from_secs(2));
            previous = delay;
        }
    }

    #[test]
    fn backoff_floors_at_one_millisecond() {
        let policy = RetryPolicy::builder()
            .initial_backoff(Duration::ZERO)
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(1));
    }

    #[test]
    fn backoff_with_unit_multiplier_stays_constant() {
        let policy = RetryPolicy::builder()
            .initial_backoff(Duration::from_millis(10))
            .multiplier(1.0)
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for_retry(50), Duration::from_millis(10));
    }

    #[test]
    fn huge_retry_index_saturates_at_max() {
        let policy = RetryPolicy::builder()
            .initial_backoff(Duration::from_secs(1))
            .max_backoff(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(policy.backoff_for_retry(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn static_policies_resolve_per_method() {
        let provider = StaticPolicies::new()
            .with_retry("svc/Get", RetryPolicy::builder().build().unwrap())
            .with_timeout("svc/Get", Duration::from_secs(5));

        assert!(provider.retry("svc/Get").is_some());
        assert!(provider.retry("svc/Put").is_none());
        assert_eq!(provider.timeout("svc/Get"), Some(Duration::from_secs(5)));
        assert!(provider.circuit_breaker("svc/Get").is_none());
    }
}
