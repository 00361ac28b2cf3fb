//! In-memory connection layer for testing code built on the transport.
//!
//! [`FakeChannel`] records every call it allocates. Each [`FakeCall`] lets a
//! test play the remote side: push messages and headers, toggle write
//! readiness and close the stream, while inspecting what the local side sent,
//! requested and cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::call::EventHandler;
use crate::channel::{
    BoxError, CallListener, MethodDescriptor, RpcCall, RpcChannel, cancelled_status,
};
use crate::config::CallOptions;

/// A fake [`RpcChannel`] that hands out [`FakeCall`]s.
#[derive(Debug, Default)]
pub struct FakeChannel {
    calls: Mutex<Vec<Arc<FakeCall>>>,
    shutdowns: AtomicUsize,
    shut_down: Arc<AtomicBool>,
}

impl FakeChannel {
    /// Create a new channel with no calls.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All calls allocated so far, in creation order.
    pub fn calls(&self) -> Vec<Arc<FakeCall>> {
        self.calls.lock().clone()
    }

    /// The most recently allocated call.
    pub fn last_call(&self) -> Option<Arc<FakeCall>> {
        self.calls.lock().last().cloned()
    }

    /// How many times [`RpcChannel::shutdown`] was invoked.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl RpcChannel for FakeChannel {
    fn new_call(&self, method: &MethodDescriptor, options: &CallOptions) -> Arc<dyn RpcCall> {
        let call = Arc::new(FakeCall::new(
            method.clone(),
            *options,
            self.shut_down.clone(),
        ));
        self.calls.lock().push(call.clone());
        call
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// How a [`FakeCall`] was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    /// The reason passed to [`RpcCall::cancel`].
    pub reason: String,
    /// The rendered cause, if one was given.
    pub cause: Option<String>,
}

#[derive(Default)]
struct FakeCallState {
    listener: Option<Arc<dyn CallListener>>,
    sent: Vec<Bytes>,
    requested: usize,
    cancellation: Option<Cancellation>,
    closed: bool,
}

/// A fake [`RpcCall`] driven by the test.
///
/// Inbound events are pushed to the listener as-is. Unlike a real
/// [`RpcCall`], the fake does not hold messages back for missing `request`
/// credit, so tests can check that the caller-facing layer does.
///
/// A call started after its channel was shut down closes with `Unavailable`.
pub struct FakeCall {
    method: MethodDescriptor,
    options: CallOptions,
    channel_shut_down: Arc<AtomicBool>,
    state: Mutex<FakeCallState>,
    ready: AtomicBool,
}

impl FakeCall {
    fn new(
        method: MethodDescriptor,
        options: CallOptions,
        channel_shut_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            method,
            options,
            channel_shut_down,
            state: Mutex::new(FakeCallState::default()),
            ready: AtomicBool::new(true),
        }
    }

    /// The method the call was allocated for.
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// The options the call was allocated with.
    pub fn options(&self) -> CallOptions {
        self.options
    }

    /// Whether [`RpcCall::start`] has been invoked.
    pub fn is_started(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    /// Messages sent by the local side.
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    /// Total number of messages requested by the local side.
    pub fn requested(&self) -> usize {
        self.state.lock().requested
    }

    /// The cancellation issued by the local side, if any.
    pub fn cancellation(&self) -> Option<Cancellation> {
        self.state.lock().cancellation.clone()
    }

    /// The listener registered by [`RpcCall::start`], for delivering events
    /// the fake itself would suppress, such as events after close.
    pub fn listener(&self) -> Option<Arc<dyn CallListener>> {
        self.state.lock().listener.clone()
    }

    /// Deliver response headers.
    pub fn push_headers(&self, headers: MetadataMap) {
        if let Some(listener) = self.open_listener() {
            listener.on_headers(headers);
        }
    }

    /// Deliver one serialized message, as if the server had sent it.
    pub fn push_message(&self, message: impl Into<Bytes>) {
        if let Some(listener) = self.open_listener() {
            listener.on_message(message.into());
        }
    }

    /// Close the stream with `status`.
    pub fn close(&self, status: Status) {
        let listener = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_close(status, MetadataMap::new());
        }
    }

    /// Change write readiness. A transition to ready notifies the listener.
    pub fn set_ready(&self, ready: bool) {
        let was_ready = self.ready.swap(ready, Ordering::SeqCst);
        if ready && !was_ready {
            if let Some(listener) = self.open_listener() {
                listener.on_ready();
            }
        }
    }

    fn open_listener(&self) -> Option<Arc<dyn CallListener>> {
        let state = self.state.lock();
        if state.closed {
            return None;
        }
        state.listener.clone()
    }
}

impl RpcCall for FakeCall {
    fn start(&self, listener: Arc<dyn CallListener>, _metadata: MetadataMap) {
        {
            let mut state = self.state.lock();
            assert!(state.listener.is_none(), "FakeCall started twice");
            state.listener = Some(listener);
        }
        if self.channel_shut_down.load(Ordering::SeqCst) {
            self.close(Status::unavailable("channel has been shut down"));
        }
    }

    fn send_message(&self, message: Bytes) {
        self.state.lock().sent.push(message);
    }

    fn request(&self, n: usize) {
        self.state.lock().requested += n;
    }

    fn cancel(&self, reason: &str, cause: Option<BoxError>) {
        {
            let mut state = self.state.lock();
            if state.cancellation.is_none() {
                state.cancellation = Some(Cancellation {
                    reason: reason.to_owned(),
                    cause: cause.as_ref().map(|c| c.to_string()),
                });
            }
        }
        self.close(cancelled_status(reason, cause));
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.state.lock().closed
    }
}

impl std::fmt::Debug for FakeCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeCall")
            .field("method", &self.method)
            .field("started", &state.listener.is_some())
            .field("sent", &state.sent.len())
            .field("requested", &state.requested)
            .field("closed", &state.closed)
            .finish()
    }
}

/// An event observed by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent<Resp> {
    /// `on_recv_message` was invoked.
    Message(Resp),
    /// `on_status_received` was invoked.
    Status(tonic::Code, String),
    /// `on_ready` was invoked.
    Ready,
}

/// An [`EventHandler`] that records every event it receives.
#[derive(Debug)]
pub struct RecordingHandler<Resp> {
    events: Arc<Mutex<Vec<HandlerEvent<Resp>>>>,
}

impl<Resp> RecordingHandler<Resp> {
    /// Create a handler and a shared view of its events.
    pub fn new() -> (Self, Arc<Mutex<Vec<HandlerEvent<Resp>>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }
}

impl<Resp: Send + 'static> EventHandler<Resp> for RecordingHandler<Resp> {
    fn on_recv_message(&self, message: Resp) {
        self.events.lock().push(HandlerEvent::Message(message));
    }

    fn on_status_received(&self, status: Status) {
        self.events.lock().push(HandlerEvent::Status(
            status.code(),
            status.message().to_owned(),
        ));
    }

    fn on_ready(&self) {
        self.events.lock().push(HandlerEvent::Ready);
    }
}
