//! Shared fakes for the integration tests: a scripted transport channel and
//! a recording listener that signals call completion across threads.

// Each test binary compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use callguard::{
    BoxCall, CallListener, CallOptions, Channel, ClientCall, Metadata, RpcStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// What the transport does with the next call it receives.
pub enum Outcome {
    /// Close immediately with this status.
    Close(RpcStatus),
    /// Deliver headers, one message, then an OK close.
    Reply(String),
}

/// Transport fake that consumes a script, one entry per opened call, and
/// delivers its callbacks synchronously from `start`.
pub struct FakeTransport {
    script: Mutex<VecDeque<Outcome>>,
    opened: AtomicUsize,
    deadlines: Mutex<Vec<Option<Instant>>>,
}

impl FakeTransport {
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            opened: AtomicUsize::new(0),
            deadlines: Mutex::new(Vec::new()),
        })
    }

    /// How many calls reached the transport.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Deadline the `index`-th call carried, if any.
    pub fn deadline_of(&self, index: usize) -> Option<Instant> {
        self.deadlines.lock().unwrap()[index]
    }
}

impl Channel<String, String> for FakeTransport {
    fn new_call(&self, _method: &str, options: CallOptions) -> BoxCall<String, String> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.deadlines.lock().unwrap().push(options.deadline());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("transport script exhausted");
        Box::new(FakeCall { outcome: Some(outcome) })
    }
}

struct FakeCall {
    outcome: Option<Outcome>,
}

impl ClientCall<String, String> for FakeCall {
    fn start(&mut self, mut listener: Box<dyn CallListener<String>>, _headers: Metadata) {
        match self.outcome.take().expect("call started twice") {
            Outcome::Close(status) => listener.on_close(status, Metadata::new()),
            Outcome::Reply(message) => {
                listener.on_headers(Metadata::new());
                listener.on_message(message);
                listener.on_close(RpcStatus::ok(), Metadata::new());
            }
        }
    }
    fn request(&mut self, _count: u32) {}
    fn send_message(&mut self, _message: String) {}
    fn half_close(&mut self) {}
    fn set_message_compression(&mut self, _enabled: bool) {}
    fn cancel(&mut self, _reason: &str) {}
    fn is_ready(&self) -> bool {
        true
    }
}

/// Listener that records what it observes and signals each `on_close` over a
/// channel, since retried attempts complete on the scheduler thread.
pub struct RecordingListener {
    messages: Arc<Mutex<Vec<String>>>,
    closes: Sender<RpcStatus>,
}

impl RecordingListener {
    pub fn new() -> (Box<dyn CallListener<String>>, Arc<Mutex<Vec<String>>>, Receiver<RpcStatus>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        (Box::new(Self { messages: messages.clone(), closes: tx }), messages, rx)
    }
}

impl CallListener<String> for RecordingListener {
    fn on_headers(&mut self, _headers: Metadata) {}

    fn on_message(&mut self, message: String) {
        self.messages.lock().unwrap().push(message);
    }

    fn on_close(&mut self, status: RpcStatus, _trailers: Metadata) {
        let _ = self.closes.send(status);
    }
}
