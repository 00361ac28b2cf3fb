//! Marshallers for encoding requests and decoding responses.
//!
//! The transport moves opaque bytes. A [`Marshaller`] converts between a
//! protocol message type and its serialized form, and is supplied as a value
//! when a [`StreamingCall`](crate::StreamingCall) is created.

use bytes::Bytes;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tonic::Status;

#[cfg(feature = "codegen-prost")]
pub mod prost;

/// Converts messages of type `T` to and from their wire representation.
///
/// Errors are reported as a [`Status`]; the call that hit the error is
/// cancelled and the status is delivered as its terminal outcome.
pub trait Marshaller<T>: Send + Sync + 'static {
    /// Serialize `message`.
    fn encode(&self, message: &T) -> Result<Bytes, Status>;

    /// Deserialize a message from `buf`.
    fn decode(&self, buf: Bytes) -> Result<T, Status>;
}

impl<T, M> Marshaller<T> for Arc<M>
where
    M: Marshaller<T> + ?Sized,
{
    fn encode(&self, message: &T) -> Result<Bytes, Status> {
        (**self).encode(message)
    }

    fn decode(&self, buf: Bytes) -> Result<T, Status> {
        (**self).decode(buf)
    }
}

/// A [`Marshaller`] built from a pair of encode/decode functions.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use tonic::Status;
/// use xds_transport::{FnMarshaller, Marshaller};
///
/// let utf8 = FnMarshaller::new(
///     |s: &String| Ok(Bytes::from(s.clone())),
///     |buf: Bytes| String::from_utf8(buf.to_vec()).map_err(|e| Status::internal(e.to_string())),
/// );
///
/// let bytes = utf8.encode(&"hello".to_string()).unwrap();
/// assert_eq!(utf8.decode(bytes).unwrap(), "hello");
/// ```
pub struct FnMarshaller<T, E, D> {
    encode: E,
    decode: D,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, E, D> FnMarshaller<T, E, D>
where
    E: Fn(&T) -> Result<Bytes, Status> + Send + Sync + 'static,
    D: Fn(Bytes) -> Result<T, Status> + Send + Sync + 'static,
{
    /// Create a marshaller from an encode and a decode function.
    pub fn new(encode: E, decode: D) -> Self {
        Self {
            encode,
            decode,
            _marker: PhantomData,
        }
    }
}

impl<T, E, D> Marshaller<T> for FnMarshaller<T, E, D>
where
    T: 'static,
    E: Fn(&T) -> Result<Bytes, Status> + Send + Sync + 'static,
    D: Fn(Bytes) -> Result<T, Status> + Send + Sync + 'static,
{
    fn encode(&self, message: &T) -> Result<Bytes, Status> {
        (self.encode)(message)
    }

    fn decode(&self, buf: Bytes) -> Result<T, Status> {
        (self.decode)(buf)
    }
}

impl<T, E, D> fmt::Debug for FnMarshaller<T, E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMarshaller").finish_non_exhaustive()
    }
}

/// A marshaller that passes [`Bytes`] through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesMarshaller;

impl Marshaller<Bytes> for BytesMarshaller {
    fn encode(&self, message: &Bytes) -> Result<Bytes, Status> {
        Ok(message.clone())
    }

    fn decode(&self, buf: Bytes) -> Result<Bytes, Status> {
        Ok(buf)
    }
}
