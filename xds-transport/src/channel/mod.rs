//! The connection layer consumed by the transport.
//!
//! An [`RpcChannel`] is one long-lived connection to a management server. It
//! allocates [`RpcCall`]s, each one a single bidirectional stream carrying
//! opaque bytes. Calls report what happens on the wire through a push-style
//! [`CallListener`].
//!
//! This is the seam for different RPC implementations:
//! - `tonic` based channel (`TonicChannel`)
//! - In-memory fake for testing (`testutil`)

use crate::config::CallOptions;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use ::tonic::Status;
use ::tonic::metadata::MetadataMap;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// An error attached as the cause of a cancellation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The shape of an RPC. Only bidirectional streaming is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    /// Both sides send a stream of messages.
    BidiStreaming,
}

/// Describes the method a call is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    full_method_name: String,
    method_type: MethodType,
}

impl MethodDescriptor {
    /// Create a descriptor for a bidirectional streaming method.
    ///
    /// `full_method_name` is usually `package.Service/Method`; a leading `/`
    /// (the HTTP/2 path form) is accepted and stripped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name is empty or contains
    /// whitespace, `?` or `#`.
    pub fn bidi_streaming(full_method_name: impl Into<String>) -> Result<Self> {
        let full_method_name = full_method_name.into();
        let trimmed = full_method_name
            .strip_prefix('/')
            .unwrap_or(&full_method_name);
        if trimmed.is_empty() {
            return Err(Error::InvalidArgument("method name must not be empty".into()));
        }
        if trimmed.contains(|c: char| c.is_whitespace() || c.is_control() || c == '?' || c == '#')
        {
            return Err(Error::InvalidArgument(format!(
                "method name is not a valid request path: '{full_method_name}'"
            )));
        }

        Ok(Self {
            full_method_name: trimmed.to_owned(),
            method_type: MethodType::BidiStreaming,
        })
    }

    /// The method name without a leading `/`.
    pub fn full_method_name(&self) -> &str {
        &self.full_method_name
    }

    /// The HTTP/2 request path, `/package.Service/Method`.
    pub fn path(&self) -> String {
        format!("/{}", self.full_method_name)
    }

    /// The call shape.
    pub fn method_type(&self) -> MethodType {
        self.method_type
    }
}

/// One connection to a server, shared by every call created from it.
pub trait RpcChannel: Send + Sync + 'static {
    /// Allocate a new stream for `method`. No network activity happens until
    /// [`RpcCall::start`] is invoked.
    fn new_call(&self, method: &MethodDescriptor, options: &CallOptions) -> Arc<dyn RpcCall>;

    /// Begin graceful shutdown. Calls already started are allowed to finish.
    fn shutdown(&self);
}

/// A single bidirectional stream over an [`RpcChannel`].
///
/// Implementations must deliver exactly one [`CallListener::on_close`] per
/// started call, after every message, and must not deliver more messages than
/// have been requested with [`RpcCall::request`].
pub trait RpcCall: Send + Sync + 'static {
    /// Start the call, sending `metadata` as request headers.
    fn start(&self, listener: Arc<dyn CallListener>, metadata: MetadataMap);

    /// Queue one serialized message for sending. Never blocks.
    fn send_message(&self, message: Bytes);

    /// Allow `n` more inbound messages to be delivered to the listener.
    fn request(&self, n: usize);

    /// Cancel the call. The listener is closed with a `Cancelled` status
    /// unless the call has already completed.
    fn cancel(&self, reason: &str, cause: Option<BoxError>);

    /// Whether a message can be sent without buffering past the ready threshold.
    fn is_ready(&self) -> bool;
}

/// Receives the raw events of an [`RpcCall`].
pub trait CallListener: Send + Sync + 'static {
    /// Response headers arrived.
    fn on_headers(&self, headers: MetadataMap);

    /// A serialized response message arrived.
    fn on_message(&self, message: Bytes);

    /// The stream closed. This is the last event for the call.
    fn on_close(&self, status: Status, trailers: MetadataMap);

    /// The call became ready to accept more outbound messages.
    fn on_ready(&self);
}

impl fmt::Debug for dyn RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RpcChannel")
    }
}

impl fmt::Debug for dyn RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCall")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Build the cancellation status reported for a locally cancelled call.
pub fn cancelled_status(reason: &str, cause: Option<BoxError>) -> Status {
    let mut status = Status::cancelled(reason);
    if let Some(cause) = cause {
        status.set_source(Arc::from(cause));
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_descriptor_accepts_both_forms() {
        let plain = MethodDescriptor::bidi_streaming(
            "envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources",
        )
        .unwrap();
        let with_slash = MethodDescriptor::bidi_streaming(
            "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources",
        )
        .unwrap();

        assert_eq!(plain, with_slash);
        assert_eq!(plain.method_type(), MethodType::BidiStreaming);
        assert_eq!(
            plain.path(),
            "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources"
        );
    }

    #[test]
    fn test_method_descriptor_accepts_short_names() {
        let method = MethodDescriptor::bidi_streaming("Discover").unwrap();
        assert_eq!(method.full_method_name(), "Discover");
        assert_eq!(method.path(), "/Discover");
    }

    #[test]
    fn test_method_descriptor_rejects_malformed_names() {
        for name in ["", "/", "svc/Dis cover", "svc/Method?x=1", "svc/Method#frag"] {
            let err = MethodDescriptor::bidi_streaming(name).unwrap_err();
            assert!(
                matches!(err, Error::InvalidArgument(_)),
                "expected InvalidArgument for {name:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_cancelled_status_keeps_cause() {
        let cause: BoxError = "watch removed".into();
        let status = cancelled_status("Cancelled by xDS client", Some(cause));
        assert_eq!(status.code(), ::tonic::Code::Cancelled);
        assert_eq!(status.message(), "Cancelled by xDS client");
        let source = std::error::Error::source(&status).unwrap();
        assert_eq!(source.to_string(), "watch removed");
    }
}
