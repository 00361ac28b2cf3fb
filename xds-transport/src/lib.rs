//! A transport abstraction for [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol) clients.
//!
//! This crate lets an xDS client exchange streamed messages with a management
//! server without depending on a particular RPC implementation. It handles:
//! - Creating a long-lived connection to a server from its target and credentials
//! - Opening bidirectional streaming calls bound to a method and a pair of marshallers
//! - Turning the call's push-style events into an [`EventHandler`] contract with
//!   pull-based inbound flow control and an explicit write-readiness signal
//!
//! It does NOT contain:
//! - xDS message schemas or the discovery protocol state machine (ACK/NACK,
//!   versions, nonces)
//! - Retry, backoff or reconnection policy
//! - Bootstrap parsing or credential resolution
//!
//! # Flow control
//!
//! Inbound messages are pulled. [`StreamingCall::start`] authorizes exactly one
//! message and each [`StreamingCall::start_recv_message`] authorizes one more;
//! nothing is delivered without a matching pull. Outbound messages are pushed,
//! and callers check [`StreamingCall::is_ready`] before each send, waiting for
//! [`EventHandler::on_ready`] when the call reports it is not ready.
//!
//! # Example
//!
//! ```ignore
//! use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
//! use xds_transport::{
//!     EventHandler, ProstMarshaller, ServerDescriptor, TonicTransportFactory, TransportConfig,
//!     TransportFactory,
//! };
//!
//! struct Handler;
//!
//! impl EventHandler<DiscoveryResponse> for Handler {
//!     fn on_recv_message(&self, response: DiscoveryResponse) {
//!         // Process the response, then pull the next one with `start_recv_message`.
//!     }
//!     fn on_status_received(&self, status: tonic::Status) {
//!         // The stream is over; decide whether to reconnect.
//!     }
//!     fn on_ready(&self) {
//!         // Resume sending requests.
//!     }
//! }
//!
//! let factory = TonicTransportFactory::new(TransportConfig::default());
//! let transport = factory.create(&ServerDescriptor::insecure("xds.example.com:18000"))?;
//! let call = transport.create_streaming_call(
//!     "envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources",
//!     ProstMarshaller::<DiscoveryRequest>::new(),
//!     ProstMarshaller::<DiscoveryResponse>::new(),
//! )?;
//!
//! call.start(Handler)?;
//! if call.is_ready() {
//!     call.send_message(&DiscoveryRequest::default())?;
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the `tonic` based transport. This enables `rt-tokio`. Enabled by default.
//! - `tonic-tls-ring`, `tonic-tls-aws-lc`: Enables TLS credentials for the `tonic` transport.
//! - `rt-tokio`: Enables the `tokio` runtime. Enabled by default.
//! - `codegen-prost`: Enables the `prost` marshaller. Enabled by default.
//! - `test-util`: Exposes an in-memory connection layer for tests.

pub mod call;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use call::{CANCEL_REASON, CallState, EventHandler, StreamingCall};
pub use channel::{BoxError, CallListener, MethodDescriptor, MethodType, RpcCall, RpcChannel};
pub use codec::{BytesMarshaller, FnMarshaller, Marshaller};
pub use config::{CallOptions, TransportConfig};
pub use error::{Error, Result};
pub use transport::{ChannelCredentials, ServerDescriptor, Transport, TransportFactory};

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use channel::tonic::{TonicCall, TonicChannel};
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::TonicTransportFactory;

// Prost marshaller
#[cfg(feature = "codegen-prost")]
pub use codec::prost::ProstMarshaller;

pub use tonic::{Code, Status};
