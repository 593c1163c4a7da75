//! The client call abstraction the resilience stages decorate.
//!
//! Mirrors the lifecycle of a gRPC client call without depending on any
//! transport: a [`Channel`] opens a [`ClientCall`] for a method, the caller
//! starts it with a [`CallListener`], sends request messages, and the
//! transport answers through the listener, finishing with exactly one
//! `on_close`. Each resilience stage implements [`Channel`] by wrapping the
//! call (and listener) returned by the next stage, so completion signals
//! propagate outward through each wrapper.
//!
//! Threading contract: call methods are invoked sequentially by the caller
//! (or by an outer wrapper); listener callbacks arrive from transport or
//! scheduler threads. A transport may deliver callbacks synchronously from
//! within `start` (wrappers must stay deadlock-free under that), but never
//! re-entrantly from the other call methods.

use crate::status::{Metadata, RpcStatus};
use std::time::{Duration, Instant};

/// Receiver side of a call: response lifecycle callbacks.
///
/// `on_close` is terminal and delivered exactly once per call handle.
pub trait CallListener<Resp>: Send {
    /// Response headers arrived.
    fn on_headers(&mut self, headers: Metadata);
    /// A response message arrived.
    fn on_message(&mut self, message: Resp);
    /// The call completed with the given terminal status and trailers.
    fn on_close(&mut self, status: RpcStatus, trailers: Metadata);
}

/// Sender side of a single RPC.
pub trait ClientCall<Req, Resp>: Send {
    /// Begin the call. Must be invoked exactly once, before any other method.
    fn start(&mut self, listener: Box<dyn CallListener<Resp>>, headers: Metadata);
    /// Request up to `count` more response messages (flow control).
    fn request(&mut self, count: u32);
    /// Send a request message.
    fn send_message(&mut self, message: Req);
    /// Signal that no further request messages will be sent.
    fn half_close(&mut self);
    /// Enable or disable outbound message compression.
    fn set_message_compression(&mut self, enabled: bool);
    /// Abort the call. Irrevocable. A transport must still deliver the
    /// terminal `on_close` for a call cancelled while in flight.
    fn cancel(&mut self, reason: &str);
    /// Whether the call can accept another outbound message without buffering.
    fn is_ready(&self) -> bool;
}

/// Boxed call handle, the form all stages produce.
pub type BoxCall<Req, Resp> = Box<dyn ClientCall<Req, Resp>>;

/// Factory for calls to a single request/response type pair.
///
/// Stages implement this by decorating the call produced by the wrapped
/// channel; the innermost implementation is the actual transport.
pub trait Channel<Req, Resp>: Send + Sync {
    /// Open a new (unstarted) call for `method` with the given options.
    fn new_call(&self, method: &str, options: CallOptions) -> BoxCall<Req, Resp>;
}

impl<C, Req, Resp> Channel<Req, Resp> for std::sync::Arc<C>
where
    C: Channel<Req, Resp> + ?Sized,
{
    fn new_call(&self, method: &str, options: CallOptions) -> BoxCall<Req, Resp> {
        (**self).new_call(method, options)
    }
}

/// Per-call options carried from caller to transport.
///
/// The deadline is absolute and set at most once per logical call; retries
/// never extend it.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    deadline: Option<Instant>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when no deadline is set.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// True when a deadline is set and has already elapsed.
    pub fn deadline_expired(&self) -> bool {
        matches!(self.time_remaining(), Some(remaining) if remaining.is_zero())
    }

    pub(crate) fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_no_deadline() {
        let opts = CallOptions::new();
        assert!(opts.deadline().is_none());
        assert!(opts.time_remaining().is_none());
        assert!(!opts.deadline_expired());
    }

    #[test]
    fn expired_deadline_is_detected() {
        let opts = CallOptions::new().with_timeout(Duration::ZERO);
        // Deadline was "now" at construction; by the time we check it has passed.
        std::thread::sleep(Duration::from_millis(1));
        assert!(opts.deadline_expired());
    }

    #[test]
    fn future_deadline_reports_remaining_time() {
        let opts = CallOptions::new().with_timeout(Duration::from_secs(60));
        let remaining = opts.time_remaining().unwrap();
        assert!(remaining > Duration::from_secs(59));
        assert!(!opts.deadline_expired());
    }
}
