//! Adapts raw [`CallListener`] events into [`EventHandler`] invocations.
//!
//! Events are queued under a lock and delivered by a single drainer, so the
//! handler sees one event at a time in order, and may re-enter the call from
//! inside a callback. The lock is never held while the handler runs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::call::EventHandler;
use crate::channel::{CallListener, RpcCall};
use crate::codec::Marshaller;

/// An event ready to be handed to the handler.
enum Event<Resp> {
    Message(Resp),
    Ready,
    Status(Status),
}

struct DispatchState<Resp> {
    /// Messages the caller has authorized but not yet received.
    credits: usize,
    /// Decoded messages waiting for credit.
    inbound: VecDeque<Resp>,
    /// A readiness notification is pending.
    ready: bool,
    /// Terminal status received from the call but not yet delivered.
    status: Option<Status>,
    /// The call has closed; no further raw events are accepted.
    closed: bool,
    /// The caller cancelled; held and later messages are dropped.
    abandoned: bool,
    /// The terminal status has been delivered.
    terminated: bool,
    /// A thread is currently delivering events.
    draining: bool,
}

impl<Resp> DispatchState<Resp> {
    fn new() -> Self {
        Self {
            credits: 0,
            inbound: VecDeque::new(),
            ready: false,
            status: None,
            closed: false,
            abandoned: false,
            terminated: false,
            draining: false,
        }
    }

    /// Pick the next event to deliver, if any.
    ///
    /// The terminal status waits until every held message has been pulled.
    fn next_event(&mut self) -> Option<Event<Resp>> {
        if self.terminated {
            return None;
        }

        if self.credits > 0 {
            if let Some(message) = self.inbound.pop_front() {
                self.credits -= 1;
                return Some(Event::Message(message));
            }
        }

        if self.ready {
            self.ready = false;
            return Some(Event::Ready);
        }

        if self.status.is_some() && self.inbound.is_empty() {
            return self.take_status();
        }

        None
    }

    fn take_status(&mut self) -> Option<Event<Resp>> {
        let status = self.status.take()?;
        self.terminated = true;
        self.ready = false;
        Some(Event::Status(status))
    }
}

/// Forwards the events of one [`RpcCall`] to one [`EventHandler`].
pub(crate) struct EventDispatcher<Resp> {
    handler: Box<dyn EventHandler<Resp>>,
    decoder: Arc<dyn Marshaller<Resp>>,
    call: Weak<dyn RpcCall>,
    state: Mutex<DispatchState<Resp>>,
}

impl<Resp: Send + 'static> EventDispatcher<Resp> {
    pub(crate) fn new(
        handler: Box<dyn EventHandler<Resp>>,
        decoder: Arc<dyn Marshaller<Resp>>,
        call: Weak<dyn RpcCall>,
    ) -> Self {
        Self {
            handler,
            decoder,
            call,
            state: Mutex::new(DispatchState::new()),
        }
    }

    /// Authorize delivery of `n` more messages.
    pub(crate) fn add_credits(&self, n: usize) {
        self.state.lock().credits += n;
        self.drain();
    }

    /// Whether the terminal status has been received from the call.
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether the terminal status has been handed to the handler.
    pub(crate) fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Drop held messages and any that arrive later, so a locally cancelled
    /// call reaches its terminal status without further pulls.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        state.abandoned = true;
        state.inbound.clear();
    }

    /// Record a terminal status. Only the first status is kept.
    fn close(&self, status: Status) {
        {
            let mut state = self.state.lock();
            if state.closed {
                tracing::trace!(code = ?status.code(), "ignoring status after close");
                return;
            }
            state.closed = true;
            state.status = Some(status);
        }
        self.drain();
    }

    fn drain(&self) {
        let mut state = self.state.lock();
        if state.draining {
            return;
        }
        state.draining = true;

        loop {
            let Some(event) = state.next_event() else {
                state.draining = false;
                return;
            };
            drop(state);

            let unwinding = ResetOnUnwind(&self.state);
            match event {
                Event::Message(message) => self.handler.on_recv_message(message),
                Event::Ready => self.handler.on_ready(),
                Event::Status(status) => {
                    tracing::debug!(code = ?status.code(), message = status.message(), "call closed");
                    self.handler.on_status_received(status);
                }
            }
            drop(unwinding);

            state = self.state.lock();
        }
    }
}

impl<Resp: Send + 'static> CallListener for EventDispatcher<Resp> {
    fn on_headers(&self, headers: MetadataMap) {
        tracing::trace!(headers = headers.len(), "discarding response headers");
    }

    fn on_message(&self, message: Bytes) {
        if self.state.lock().closed {
            return;
        }

        match self.decoder.decode(message) {
            Ok(message) => {
                {
                    let mut state = self.state.lock();
                    if state.closed || state.abandoned {
                        return;
                    }
                    state.inbound.push_back(message);
                }
                self.drain();
            }
            Err(status) => {
                tracing::warn!(error = %status.message(), "failed to decode response, cancelling call");
                let status = Status::internal(format!(
                    "failed to decode response: {}",
                    status.message()
                ));
                let reason = status.message().to_owned();
                self.close(status);
                if let Some(call) = self.call.upgrade() {
                    call.cancel(&reason, None);
                }
            }
        }
    }

    fn on_close(&self, status: Status, _trailers: MetadataMap) {
        self.close(status);
    }

    fn on_ready(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.ready = true;
        }
        self.drain();
    }
}

/// Clears the draining flag if a handler callback panics, so a later event
/// can start a new drainer.
struct ResetOnUnwind<'a, Resp>(&'a Mutex<DispatchState<Resp>>);

impl<Resp> Drop for ResetOnUnwind<'_, Resp> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

impl<Resp> fmt::Debug for EventDispatcher<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventDispatcher")
            .field("credits", &state.credits)
            .field("held", &state.inbound.len())
            .field("closed", &state.closed)
            .field("terminated", &state.terminated)
            .finish()
    }
}
