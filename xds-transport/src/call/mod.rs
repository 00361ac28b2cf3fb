//! Streaming calls and the event handler contract.
//!
//! A [`StreamingCall`] wraps one bidirectional stream. Inbound messages are
//! pulled: [`start`](StreamingCall::start) authorizes the first message and
//! every [`start_recv_message`](StreamingCall::start_recv_message) authorizes
//! one more. Outbound messages are pushed, and callers check
//! [`is_ready`](StreamingCall::is_ready) before each send, waiting for
//! [`EventHandler::on_ready`] when it returns false.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};

use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::channel::{BoxError, MethodDescriptor, RpcCall};
use crate::codec::Marshaller;
use crate::error::{Error, Result};

mod dispatch;

use dispatch::EventDispatcher;

/// Reason attached to calls cancelled through [`StreamingCall::send_error`].
pub const CANCEL_REASON: &str = "Cancelled by xDS client";

/// Receives the events of a [`StreamingCall`].
///
/// Callbacks are invoked from the transport's execution context, one at a
/// time, and may call back into the [`StreamingCall`].
pub trait EventHandler<Resp>: Send + Sync + 'static {
    /// A message requested through the pull credit arrived.
    fn on_recv_message(&self, message: Resp);

    /// The call completed. Invoked exactly once and always last.
    ///
    /// Both a clean close (`Code::Ok`) and a failure are reported here.
    fn on_status_received(&self, status: Status);

    /// The call became ready to accept more outbound messages.
    fn on_ready(&self);
}

/// Lifecycle of a [`StreamingCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created but not started.
    Unstarted,
    /// Started; messages can be sent and received.
    Active,
    /// Cancelled locally or closed by the remote. No further transitions.
    Terminated,
}

/// One bidirectional streaming call to an xDS server.
///
/// Created by [`Transport::create_streaming_call`](crate::Transport::create_streaming_call).
pub struct StreamingCall<Req, Resp> {
    method: MethodDescriptor,
    call: Arc<dyn RpcCall>,
    encoder: Arc<dyn Marshaller<Req>>,
    decoder: Arc<dyn Marshaller<Resp>>,
    dispatcher: OnceLock<Arc<EventDispatcher<Resp>>>,
    cancelled: AtomicBool,
}

impl<Req, Resp> StreamingCall<Req, Resp>
where
    Req: 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(
        method: MethodDescriptor,
        call: Arc<dyn RpcCall>,
        encoder: Arc<dyn Marshaller<Req>>,
        decoder: Arc<dyn Marshaller<Resp>>,
    ) -> Self {
        Self {
            method,
            call,
            encoder,
            decoder,
            dispatcher: OnceLock::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Start the call, binding `handler` for its whole lifetime.
    ///
    /// The first inbound message is authorized immediately; every further
    /// message needs a call to [`start_recv_message`](Self::start_recv_message).
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the call was already started. The
    /// handler bound by the first call is kept.
    pub fn start(&self, handler: impl EventHandler<Resp>) -> Result<()> {
        let mut created = None;
        self.dispatcher.get_or_init(|| {
            let dispatcher = Arc::new(EventDispatcher::new(
                Box::new(handler),
                self.decoder.clone(),
                Arc::downgrade(&self.call),
            ));
            created = Some(dispatcher.clone());
            dispatcher
        });
        let Some(dispatcher) = created else {
            return Err(Error::IllegalState("call already started"));
        };

        tracing::debug!(method = self.method.full_method_name(), "starting streaming call");
        self.call.start(dispatcher.clone(), MetadataMap::new());
        self.request_one(&dispatcher);
        Ok(())
    }

    /// Encode and send one message.
    ///
    /// This does not check readiness. Callers should consult
    /// [`is_ready`](Self::is_ready) first, since sending while not ready
    /// buffers without bound. Transport failures, and a failure to encode
    /// `message`, are reported through
    /// [`EventHandler::on_status_received`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the call is not active.
    pub fn send_message(&self, message: &Req) -> Result<()> {
        let dispatcher = self.active()?;
        if dispatcher.is_closed() {
            return Err(Error::IllegalState("call is closed"));
        }

        match self.encoder.encode(message) {
            Ok(bytes) => {
                tracing::trace!(len = bytes.len(), "sending message");
                self.call.send_message(bytes);
            }
            Err(status) => {
                tracing::warn!(error = %status.message(), "failed to encode request, cancelling call");
                self.cancel(
                    &format!("failed to encode request: {}", status.message()),
                    Some(Box::new(status)),
                );
            }
        }
        Ok(())
    }

    /// Authorize delivery of one more inbound message.
    ///
    /// Authorizations accumulate. After a clean remote close this can still
    /// be used to drain messages that arrived before the close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the call is not started, was
    /// cancelled, or has delivered its terminal status.
    pub fn start_recv_message(&self) -> Result<()> {
        let dispatcher = self.active()?;
        self.request_one(dispatcher);
        Ok(())
    }

    /// Cancel the call, attributing `cause`.
    ///
    /// Cancellation is best effort: events already in flight may still be
    /// delivered, and the terminal status may carry a code other than
    /// `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the call is not active.
    pub fn send_error(&self, cause: impl Into<BoxError>) -> Result<()> {
        self.active()?;
        self.cancel(CANCEL_REASON, Some(cause.into()));
        Ok(())
    }

    /// Whether the underlying stream accepts another message without
    /// buffering past its threshold. False unless the call is active.
    pub fn is_ready(&self) -> bool {
        self.state() == CallState::Active && self.call.is_ready()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> CallState {
        match self.dispatcher.get() {
            None => CallState::Unstarted,
            Some(dispatcher) => {
                if self.cancelled.load(Ordering::Acquire) || dispatcher.is_closed() {
                    CallState::Terminated
                } else {
                    CallState::Active
                }
            }
        }
    }

    /// The method this call is bound to.
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Returns the dispatcher if the call is started, not cancelled, and its
    /// terminal status has not been delivered.
    fn active(&self) -> Result<&Arc<EventDispatcher<Resp>>> {
        let Some(dispatcher) = self.dispatcher.get() else {
            return Err(Error::IllegalState("call not started"));
        };
        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::IllegalState("call was cancelled"));
        }
        if dispatcher.is_terminated() {
            return Err(Error::IllegalState("call has terminated"));
        }
        Ok(dispatcher)
    }

    fn request_one(&self, dispatcher: &EventDispatcher<Resp>) {
        self.call.request(1);
        dispatcher.add_credits(1);
    }

    fn cancel(&self, reason: &str, cause: Option<BoxError>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(method = self.method.full_method_name(), reason, "cancelling streaming call");
        // Pulls are refused from here on, so held messages could never be
        // delivered and would keep the status back.
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.abandon();
        }
        self.call.cancel(reason, cause);
    }
}

impl<Req, Resp> fmt::Debug for StreamingCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingCall")
            .field("method", &self.method)
            .field("started", &self.dispatcher.get().is_some())
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests;
