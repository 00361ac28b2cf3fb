//! Prost-based marshaller for generated protobuf messages.

use crate::codec::Marshaller;
use bytes::Bytes;
use prost::Message;
use std::fmt;
use std::marker::PhantomData;
use tonic::Status;

/// A marshaller for any [`prost::Message`], such as the envoy-types
/// `DiscoveryRequest` and `DiscoveryResponse`.
///
/// # Example
///
/// ```ignore
/// use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
/// use xds_transport::ProstMarshaller;
///
/// let call = transport.create_streaming_call(
///     ADS_METHOD,
///     ProstMarshaller::<DiscoveryRequest>::new(),
///     ProstMarshaller::<DiscoveryResponse>::new(),
/// )?;
/// ```
pub struct ProstMarshaller<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> ProstMarshaller<T> {
    /// Create a new marshaller.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for ProstMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ProstMarshaller<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ProstMarshaller<T> {}

impl<T> fmt::Debug for ProstMarshaller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProstMarshaller")
            .field("message", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Marshaller<T> for ProstMarshaller<T>
where
    T: Message + Default + 'static,
{
    fn encode(&self, message: &T) -> Result<Bytes, Status> {
        Ok(message.encode_to_vec().into())
    }

    fn decode(&self, buf: Bytes) -> Result<T, Status> {
        T::decode(buf).map_err(|e| Status::internal(format!("failed to decode message: {e}")))
    }
}
