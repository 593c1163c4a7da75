//! Channel decorator that transparently retries failed calls.
//!
//! A [`RetryingCall`] presents one stable call handle to the caller while
//! internally opening a fresh transport call per attempt. The first request
//! message is buffered for replay; a second message disables retries for the
//! call, since an arbitrary-length client stream cannot be replayed without
//! unbounded buffering. Once any headers or response message have been
//! observed for the current attempt, a later failure is never retried, so a
//! partially delivered response is never silently restarted.
//!
//! Locking discipline: one mutex guards the attempt state, a second guards
//! the caller listener. The state lock is never held while invoking the
//! caller listener or while starting a transport attempt, because the next
//! stage may complete a call synchronously from `start` (breaker rejection)
//! and `on_message` handlers routinely call `request` back into the call.

use crate::call::{BoxCall, CallListener, CallOptions, Channel, ClientCall};
use crate::policy::{PolicyProvider, RetryPolicy};
use crate::scheduler::RetryScheduler;
use crate::status::{Metadata, RpcStatus};
use std::sync::{Arc, Mutex, MutexGuard};

/// Retrying channel decorator.
pub struct RetryStage<C> {
    inner: Arc<C>,
    provider: Arc<dyn PolicyProvider>,
    scheduler: Arc<RetryScheduler>,
}

impl<C> RetryStage<C> {
    pub fn new(inner: C, provider: Arc<dyn PolicyProvider>, scheduler: Arc<RetryScheduler>) -> Self {
        Self { inner: Arc::new(inner), provider, scheduler }
    }

    pub(crate) fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C, Req, Resp> Channel<Req, Resp> for RetryStage<C>
where
    C: Channel<Req, Resp> + 'static,
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn new_call(&self, method: &str, options: CallOptions) -> BoxCall<Req, Resp> {
        match self.provider.retry(method) {
            Some(policy) if policy.max_attempts() > 1 => Box::new(RetryingCall {
                shared: Arc::new(RetryShared {
                    channel: self.inner.clone(),
                    method: method.to_string(),
                    options,
                    policy,
                    scheduler: self.scheduler.clone(),
                    state: Mutex::new(AttemptState::new()),
                    listener: Mutex::new(None),
                }),
            }),
            // Single-attempt policies retry nothing; skip the wrapper.
            _ => self.inner.new_call(method, options),
        }
    }
}

/// Mutable per-call bookkeeping, guarded by one mutex per call instance.
struct AttemptState<Req, Resp> {
    /// 1-indexed once started; 0 means no attempt yet.
    attempt: u32,
    /// Headers or a message arrived on the current attempt.
    response_received: bool,
    /// Set once a second request message is sent; streaming requests cannot
    /// be replayed.
    retry_disabled: bool,
    cancelled: bool,
    started: bool,
    headers: Option<Metadata>,
    message_sent: bool,
    buffered_message: Option<Req>,
    pending_requests: u32,
    half_closed: bool,
    compression: Option<bool>,
    /// The live transport attempt, replaced on each retry.
    current: Option<BoxCall<Req, Resp>>,
}

impl<Req, Resp> AttemptState<Req, Resp> {
    fn new() -> Self {
        Self {
            attempt: 0,
            response_received: false,
            retry_disabled: false,
            cancelled: false,
            started: false,
            headers: None,
            message_sent: false,
            buffered_message: None,
            pending_requests: 0,
            half_closed: false,
            compression: None,
            current: None,
        }
    }
}

struct RetryShared<Req, Resp, C> {
    channel: Arc<C>,
    method: String,
    options: CallOptions,
    policy: RetryPolicy,
    scheduler: Arc<RetryScheduler>,
    state: Mutex<AttemptState<Req, Resp>>,
    listener: Mutex<Option<Box<dyn CallListener<Resp>>>>,
}

/// Everything needed to bring a fresh attempt up to the caller's progress.
struct Replay<Req> {
    pending_requests: u32,
    message: Option<Req>,
    half_closed: bool,
    compression: Option<bool>,
}

impl<Req, Resp, C> RetryShared<Req, Resp, C> {
    fn state(&self) -> MutexGuard<'_, AttemptState<Req, Resp>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver the terminal status to the caller, exactly once.
    fn deliver_close(&self, status: RpcStatus, trailers: Metadata) {
        let listener = {
            let mut guard = self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };
        if let Some(mut listener) = listener {
            listener.on_close(status, trailers);
        }
    }

    fn with_listener(&self, forward: impl FnOnce(&mut dyn CallListener<Resp>)) {
        let mut guard = self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listener) = guard.as_mut() {
            forward(listener.as_mut());
        }
    }
}

impl<Req, Resp, C> RetryShared<Req, Resp, C>
where
    C: Channel<Req, Resp> + 'static,
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    /// Open, start, and replay the next transport attempt.
    fn start_attempt(self: &Arc<Self>) {
        let (mut call, attempt, headers, replay) = {
            let mut st = self.state();
            if st.cancelled {
                return;
            }
            st.attempt += 1;
            st.response_received = false;
            st.current = None;
            let replay = Replay {
                pending_requests: st.pending_requests,
                message: st.buffered_message.clone(),
                half_closed: st.half_closed,
                compression: st.compression,
            };
            let call = self.channel.new_call(&self.method, self.options.clone());
            (call, st.attempt, st.headers.clone().unwrap_or_default(), replay)
        };

        // Start and replay outside the state lock: the stage below may close
        // the call synchronously from start (breaker rejection), re-entering
        // the attempt listener on this thread.
        let replayed_message = replay.message.is_some();
        if let Some(enabled) = replay.compression {
            call.set_message_compression(enabled);
        }
        call.start(Box::new(AttemptListener { shared: self.clone(), attempt }), headers);
        if replay.pending_requests > 0 {
            call.request(replay.pending_requests);
        }
        if let Some(message) = replay.message {
            call.send_message(message);
        }
        if replay.half_closed {
            call.half_close();
        }

        let mut st = self.state();
        if st.cancelled {
            call.cancel("call cancelled");
            return;
        }
        // A synchronous close may already have scheduled (or even started)
        // the next attempt; never install a stale call over it.
        if st.attempt != attempt {
            return;
        }
        // The caller may have progressed while the attempt was starting and
        // found no live call to forward to; the replay above ran against a
        // snapshot, so forward whatever it missed before installing.
        if st.compression != replay.compression {
            if let Some(enabled) = st.compression {
                call.set_message_compression(enabled);
            }
        }
        let newly_requested = st.pending_requests.saturating_sub(replay.pending_requests);
        if newly_requested > 0 {
            call.request(newly_requested);
        }
        if !replayed_message {
            if let Some(message) = st.buffered_message.clone() {
                call.send_message(message);
            }
        }
        if st.half_closed && !replay.half_closed {
            call.half_close();
        }
        st.current = Some(call);
    }
}

/// A retry parked on the scheduler, carrying the failure that caused it.
///
/// If the scheduler drops the job without firing it (shutdown with the
/// backoff still pending), the buffered failure is delivered so the caller
/// still observes a terminal close instead of hanging.
struct PendingRetry<Req, Resp, C> {
    shared: Arc<RetryShared<Req, Resp, C>>,
    failure: Option<(RpcStatus, Metadata)>,
}

impl<Req, Resp, C> PendingRetry<Req, Resp, C>
where
    C: Channel<Req, Resp> + 'static,
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn fire(mut self) {
        self.failure = None;
        self.shared.start_attempt();
    }
}

impl<Req, Resp, C> Drop for PendingRetry<Req, Resp, C> {
    fn drop(&mut self) {
        if let Some((status, trailers)) = self.failure.take() {
            self.shared.deliver_close(status, trailers);
        }
    }
}

/// Stable call handle covering every attempt of one logical RPC.
pub struct RetryingCall<Req, Resp, C> {
    shared: Arc<RetryShared<Req, Resp, C>>,
}

impl<Req, Resp, C> ClientCall<Req, Resp> for RetryingCall<Req, Resp, C>
where
    C: Channel<Req, Resp> + 'static,
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn start(&mut self, listener: Box<dyn CallListener<Resp>>, headers: Metadata) {
        {
            let mut st = self.shared.state();
            assert!(!st.started, "call already started");
            st.started = true;
            st.headers = Some(headers);
        }
        {
            let mut guard =
                self.shared.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Some(listener);
        }
        self.shared.start_attempt();
    }

    fn request(&mut self, count: u32) {
        let mut st = self.shared.state();
        st.pending_requests = st.pending_requests.saturating_add(count);
        if let Some(call) = st.current.as_mut() {
            call.request(count);
        }
    }

    fn send_message(&mut self, message: Req) {
        let mut st = self.shared.state();
        let replayable = !st.message_sent;
        if replayable {
            st.message_sent = true;
            st.buffered_message = Some(message.clone());
        } else {
            if !st.retry_disabled {
                tracing::debug!(
                    method = %self.shared.method,
                    "second request message observed, disabling retries"
                );
            }
            st.retry_disabled = true;
        }
        if let Some(call) = st.current.as_mut() {
            call.send_message(message);
        } else if !replayable {
            // Only the first message is buffered; a later one arriving with
            // no live attempt (backoff window) has nowhere to go and is
            // dropped.
            tracing::debug!(
                method = %self.shared.method,
                "dropping non-replayable request message, no live attempt"
            );
        }
    }

    fn half_close(&mut self) {
        let mut st = self.shared.state();
        st.half_closed = true;
        if let Some(call) = st.current.as_mut() {
            call.half_close();
        }
    }

    fn set_message_compression(&mut self, enabled: bool) {
        let mut st = self.shared.state();
        st.compression = Some(enabled);
        if let Some(call) = st.current.as_mut() {
            call.set_message_compression(enabled);
        }
    }

    fn cancel(&mut self, reason: &str) {
        let live = {
            let mut st = self.shared.state();
            if st.cancelled {
                return;
            }
            st.cancelled = true;
            st.current.take()
        };
        match live {
            Some(mut call) => call.cancel(reason),
            // No live attempt means no transport will deliver a terminal
            // close (a parked retry consumed the last one), so synthesize it
            // here. Harmless before start: there is no listener yet.
            None => self.shared.deliver_close(RpcStatus::cancelled(reason), Metadata::new()),
        }
    }

    fn is_ready(&self) -> bool {
        let st = self.shared.state();
        st.current.as_ref().is_some_and(|call| call.is_ready())
    }
}

/// Listener wrapping one transport attempt.
struct AttemptListener<Req, Resp, C> {
    shared: Arc<RetryShared<Req, Resp, C>>,
    /// Attempt this listener belongs to; stale events are dropped.
    attempt: u32,
}

impl<Req, Resp, C> CallListener<Resp> for AttemptListener<Req, Resp, C>
where
    C: Channel<Req, Resp> + 'static,
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn on_headers(&mut self, headers: Metadata) {
        {
            let mut st = self.shared.state();
            if st.attempt != self.attempt {
                return;
            }
            st.response_received = true;
        }
        self.shared.with_listener(|listener| listener.on_headers(headers));
    }

    fn on_message(&mut self, message: Resp) {
        {
            let mut st = self.shared.state();
            if st.attempt != self.attempt {
                return;
            }
            st.response_received = true;
        }
        self.shared.with_listener(|listener| listener.on_message(message));
    }

    fn on_close(&mut self, status: RpcStatus, trailers: Metadata) {
        let retry_delay = {
            let mut st = self.shared.state();
            if st.attempt != self.attempt {
                return;
            }
            let eligible = !st.cancelled
                && !st.retry_disabled
                && !st.response_received
                && self.shared.policy.is_retryable(status.code())
                && st.attempt < self.shared.policy.max_attempts()
                && !self.shared.options.deadline_expired();
            if eligible {
                // The attempt is terminal; a cancel landing during the
                // backoff must find no live call, so it can synthesize the
                // close itself.
                st.current = None;
                Some(self.shared.policy.backoff_for_retry(st.attempt))
            } else {
                None
            }
        };

        match retry_delay {
            Some(delay) => {
                tracing::debug!(
                    method = %self.shared.method,
                    attempt = self.attempt,
                    code = %status.code(),
                    ?delay,
                    "scheduling retry"
                );
                // The parked job carries the failure; if the scheduler drops
                // it instead of firing (shutdown), the drop delivers it.
                let pending =
                    PendingRetry { shared: self.shared.clone(), failure: Some((status, trailers)) };
                let scheduled = self.shared.scheduler.schedule(delay, move || pending.fire());
                if scheduled.is_err() {
                    tracing::warn!(
                        method = %self.shared.method,
                        "retry scheduler unavailable, delivering failure"
                    );
                }
            }
            None => self.shared.deliver_close(status, trailers),
        }
    }
}
