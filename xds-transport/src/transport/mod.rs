//! Transports to xDS management servers.
//!
//! A [`TransportFactory`] turns a [`ServerDescriptor`] into a [`Transport`]:
//! one connection to one server, from which any number of
//! [`StreamingCall`]s are created.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::call::StreamingCall;
use crate::channel::{MethodDescriptor, RpcChannel};
use crate::codec::Marshaller;
use crate::config::CallOptions;
use crate::error::{Error, Result};

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// Credentials used to secure the connection to a server.
#[derive(Debug, Clone, Default)]
pub enum ChannelCredentials {
    /// Plaintext HTTP/2.
    #[default]
    Insecure,
    /// TLS with the given client configuration.
    #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
    Tls(::tonic::transport::ClientTlsConfig),
}

/// Identifies an xDS management server: where it lives and how to
/// authenticate to it.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    target: String,
    credentials: ChannelCredentials,
}

impl ServerDescriptor {
    /// Create a descriptor for `target`, e.g. `https://xds.example.com:443`.
    pub fn new(target: impl Into<String>, credentials: ChannelCredentials) -> Self {
        Self {
            target: target.into(),
            credentials,
        }
    }

    /// Create a descriptor for a plaintext connection to `target`.
    pub fn insecure(target: impl Into<String>) -> Self {
        Self::new(target, ChannelCredentials::Insecure)
    }

    /// The server address.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The credentials for the connection.
    pub fn credentials(&self) -> &ChannelCredentials {
        &self.credentials
    }

    /// Check that the descriptor names a server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the target is empty.
    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "server target must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Creates [`Transport`]s for xDS servers.
///
/// Implementations must not block on network I/O; connections are
/// established lazily by the underlying [`RpcChannel`].
pub trait TransportFactory: Send + Sync + 'static {
    /// Create a transport bound to `server`'s target and credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the descriptor is unusable.
    fn create(&self, server: &ServerDescriptor) -> Result<Transport>;
}

/// One connection to an xDS server.
///
/// The connection is shared by every call created from the transport and is
/// released by [`shutdown`](Transport::shutdown). A transport cannot be used
/// to create calls after it has been shut down.
pub struct Transport {
    target: String,
    channel: Arc<dyn RpcChannel>,
    call_options: CallOptions,
    shutdown: AtomicBool,
}

impl Transport {
    /// Create a transport over an established `channel`.
    pub fn new(
        target: impl Into<String>,
        channel: Arc<dyn RpcChannel>,
        call_options: CallOptions,
    ) -> Self {
        Self {
            target: target.into(),
            channel,
            call_options,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Create a bidirectional streaming call for `method_name`.
    ///
    /// The stream is allocated but no network activity happens until
    /// [`StreamingCall::start`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `method_name` is empty or malformed. No
    ///   stream is allocated in that case.
    /// - [`Error::IllegalState`] if the transport has been shut down.
    pub fn create_streaming_call<Req, Resp>(
        &self,
        method_name: &str,
        request_marshaller: impl Marshaller<Req>,
        response_marshaller: impl Marshaller<Resp>,
    ) -> Result<StreamingCall<Req, Resp>>
    where
        Req: 'static,
        Resp: Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::IllegalState("transport has been shut down"));
        }
        let method = MethodDescriptor::bidi_streaming(method_name)?;

        tracing::trace!(server = %self.target, method = method.full_method_name(), "allocating stream");
        let call = self.channel.new_call(&method, &self.call_options);
        Ok(StreamingCall::new(
            method,
            call,
            Arc::new(request_marshaller),
            Arc::new(response_marshaller),
        ))
    }

    /// Shut down the connection.
    ///
    /// Calls in flight are allowed to drain according to the connection's own
    /// policy. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(server = %self.target, "shutting down xDS transport");
        self.channel.shutdown();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The server address this transport is connected to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The options applied to calls created by this transport.
    pub fn call_options(&self) -> CallOptions {
        self.call_options
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("target", &self.target)
            .field("call_options", &self.call_options)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BytesMarshaller;
    use crate::testutil::FakeChannel;

    fn transport(channel: &Arc<FakeChannel>) -> Transport {
        Transport::new("ctrl-plane:443", channel.clone(), CallOptions::default())
    }

    #[test]
    fn test_create_streaming_call_allocates_stream() {
        let channel = FakeChannel::new();
        let transport = transport(&channel);

        let call = transport
            .create_streaming_call("Discover", BytesMarshaller, BytesMarshaller)
            .unwrap();

        assert_eq!(call.method().full_method_name(), "Discover");
        let calls = channel.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method().path(), "/Discover");
        assert!(!calls[0].is_started());
    }

    #[test]
    fn test_empty_method_name_allocates_nothing() {
        let channel = FakeChannel::new();
        let transport = transport(&channel);

        let err = transport
            .create_streaming_call("", BytesMarshaller, BytesMarshaller)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(channel.calls().is_empty());
    }

    #[test]
    fn test_call_options_are_passed_to_channel() {
        let channel = FakeChannel::new();
        let options = CallOptions {
            wait_for_ready: true,
        };
        let transport = Transport::new("ctrl-plane:443", channel.clone(), options);

        transport
            .create_streaming_call("Discover", BytesMarshaller, BytesMarshaller)
            .unwrap();

        assert!(channel.last_call().unwrap().options().wait_for_ready);
        assert_eq!(transport.call_options(), options);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_terminal() {
        let channel = FakeChannel::new();
        let transport = transport(&channel);

        transport.shutdown();
        transport.shutdown();

        assert!(transport.is_shutdown());
        assert_eq!(channel.shutdown_count(), 1);

        let err = transport
            .create_streaming_call("Discover", BytesMarshaller, BytesMarshaller)
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        assert!(channel.calls().is_empty());
    }

    #[test]
    fn test_server_descriptor_validation() {
        assert!(ServerDescriptor::insecure("ctrl-plane:443").validate().is_ok());

        let err = ServerDescriptor::insecure("  ").validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
