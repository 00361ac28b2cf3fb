//! `tonic` based connection layer.
//!
//! Each [`TonicCall`] runs a background task that opens the stream with
//! tonic's low-level `Grpc` client and a `BytesCodec`, so serialization stays
//! with the caller's marshallers.
//!
//! Inbound messages are read one at a time and handed to the listener only
//! against a pull credit, so a slow consumer leaves data in the HTTP/2 flow
//! control window instead of in memory. Outbound messages go through an
//! unbounded queue whose size in bytes decides readiness.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_stream::Stream;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Code, Request, Status, Streaming};

use crate::channel::{
    BoxError, CallListener, MethodDescriptor, RpcCall, RpcChannel, cancelled_status,
};
use crate::config::CallOptions;

/// Pause between attempts to open a stream on a call that waits for ready.
const WAIT_FOR_READY_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A codec that passes bytes through without serialization.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// An [`RpcChannel`] backed by a tonic [`Channel`].
///
/// Calls are driven on the Tokio runtime identified by `handle`.
pub struct TonicChannel {
    channel: Mutex<Option<Channel>>,
    shut_down: Arc<AtomicBool>,
    handle: Handle,
    on_ready_threshold: usize,
}

impl TonicChannel {
    /// Wrap an existing tonic [`Channel`].
    ///
    /// Use this when the channel needs configuration the factory does not
    /// expose.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tonic::transport::Channel;
    ///
    /// let channel = Channel::from_static("http://xds.example.com:18000").connect_lazy();
    /// let channel = TonicChannel::new(channel, Handle::current(), DEFAULT_ON_READY_THRESHOLD);
    /// let transport = Transport::new("xds.example.com:18000", Arc::new(channel), CallOptions::default());
    /// ```
    pub fn new(channel: Channel, handle: Handle, on_ready_threshold: usize) -> Self {
        Self {
            channel: Mutex::new(Some(channel)),
            shut_down: Arc::new(AtomicBool::new(false)),
            handle,
            on_ready_threshold: on_ready_threshold.max(1),
        }
    }
}

impl RpcChannel for TonicChannel {
    fn new_call(&self, method: &MethodDescriptor, options: &CallOptions) -> Arc<dyn RpcCall> {
        let path = PathAndQuery::try_from(method.path())
            .map_err(|e| format!("invalid method path '{}': {e}", method.path()));
        Arc::new(TonicCall::new(
            self.channel.lock().clone(),
            self.shut_down.clone(),
            path,
            *options,
            self.handle.clone(),
            self.on_ready_threshold,
        ))
    }

    fn shutdown(&self) {
        // Started calls hold their own clones and keep the connection alive
        // until they finish. Calls that have not started yet fail on start.
        self.shut_down.store(true, Ordering::Release);
        self.channel.lock().take();
    }
}

impl fmt::Debug for TonicChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TonicChannel")
            .field("shutdown", &self.channel.lock().is_none())
            .field("on_ready_threshold", &self.on_ready_threshold)
            .finish()
    }
}

/// Outbound messages waiting to be written to the request body.
struct WriteQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    queued_bytes: AtomicUsize,
    threshold: usize,
}

impl WriteQueue {
    fn new(threshold: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            queued_bytes: AtomicUsize::new(0),
            threshold,
        }
    }

    fn push(&self, message: Bytes) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            tracing::trace!("dropping message sent on a closed call");
            return;
        };
        let len = message.len();
        self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        if tx.send(message).is_err() {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
        }
    }

    /// Account for a message taken by the request body. Returns true if this
    /// moved the queue from not ready to ready.
    fn taken(&self, len: usize) -> bool {
        let before = self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
        before >= self.threshold && before - len < self.threshold
    }

    fn is_ready(&self) -> bool {
        self.tx.lock().is_some() && self.queued_bytes.load(Ordering::Acquire) < self.threshold
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// An [`RpcCall`] on a [`TonicChannel`].
///
/// Dropping the call without cancelling it cancels the stream.
pub struct TonicCall {
    channel: Option<Channel>,
    shut_down: Arc<AtomicBool>,
    path: Result<PathAndQuery, String>,
    options: CallOptions,
    handle: Handle,
    writes: Arc<WriteQueue>,
    credits: Arc<Semaphore>,
    cancel: watch::Sender<Option<Status>>,
    started: AtomicBool,
}

impl TonicCall {
    fn new(
        channel: Option<Channel>,
        shut_down: Arc<AtomicBool>,
        path: Result<PathAndQuery, String>,
        options: CallOptions,
        handle: Handle,
        on_ready_threshold: usize,
    ) -> Self {
        let (cancel, _) = watch::channel(None);
        Self {
            channel,
            shut_down,
            path,
            options,
            handle,
            writes: Arc::new(WriteQueue::new(on_ready_threshold)),
            credits: Arc::new(Semaphore::new(0)),
            cancel,
            started: AtomicBool::new(false),
        }
    }
}

impl RpcCall for TonicCall {
    fn start(&self, listener: Arc<dyn CallListener>, metadata: MetadataMap) {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("ignoring second start of a tonic call");
            return;
        }

        let path = match &self.path {
            Ok(path) => path.clone(),
            Err(e) => {
                self.writes.close();
                listener.on_close(Status::internal(e.clone()), MetadataMap::new());
                return;
            }
        };

        let driver = CallDriver {
            channel: self.channel.clone(),
            shut_down: self.shut_down.clone(),
            path,
            options: self.options,
            writes: self.writes.clone(),
            credits: self.credits.clone(),
            cancel: self.cancel.subscribe(),
            listener,
            metadata,
        };
        self.handle.spawn(driver.run());
    }

    fn send_message(&self, message: Bytes) {
        self.writes.push(message);
    }

    fn request(&self, n: usize) {
        self.credits.add_permits(n);
    }

    fn cancel(&self, reason: &str, cause: Option<BoxError>) {
        let status = cancelled_status(reason, cause);
        self.cancel.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        });
    }

    fn is_ready(&self) -> bool {
        self.writes.is_ready()
    }
}

impl fmt::Debug for TonicCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TonicCall")
            .field("path", &self.path)
            .field("options", &self.options)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("queued_bytes", &self.writes.queued_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

/// Runs one call to completion on the Tokio runtime.
struct CallDriver {
    channel: Option<Channel>,
    shut_down: Arc<AtomicBool>,
    path: PathAndQuery,
    options: CallOptions,
    writes: Arc<WriteQueue>,
    credits: Arc<Semaphore>,
    cancel: watch::Receiver<Option<Status>>,
    listener: Arc<dyn CallListener>,
    metadata: MetadataMap,
}

impl CallDriver {
    async fn run(mut self) {
        let (status, trailers) = match self.open().await {
            Ok(inbound) => {
                self.listener.on_ready();
                self.read(inbound).await
            }
            Err(status) => (status, MetadataMap::new()),
        };
        self.writes.close();
        tracing::trace!(path = %self.path, code = ?status.code(), "tonic call finished");
        self.listener.on_close(status, trailers);
    }

    /// Open the stream, retrying `Unavailable` failures if the call waits for
    /// ready.
    async fn open(&mut self) -> Result<Streaming<Bytes>, Status> {
        let channel = match &self.channel {
            Some(channel) if !self.shut_down.load(Ordering::Acquire) => channel.clone(),
            _ => return Err(Status::unavailable("channel has been shut down")),
        };

        loop {
            let attempt = {
                let channel = channel.clone();
                let path = self.path.clone();
                let metadata = self.metadata.clone();
                let body = outbound(self.writes.clone(), self.listener.clone());
                async move {
                    let mut grpc = Grpc::new(channel);
                    grpc.ready()
                        .await
                        .map_err(|e| Status::unavailable(format!("channel not ready: {e}")))?;
                    let mut request = Request::new(body);
                    *request.metadata_mut() = metadata;
                    grpc.streaming(request, path, BytesCodec).await
                }
            };

            let result = tokio::select! {
                biased;
                status = cancelled(&mut self.cancel) => return Err(status),
                result = attempt => result,
            };

            match result {
                Ok(response) => {
                    let (headers, inbound, _) = response.into_parts();
                    self.listener.on_headers(headers);
                    return Ok(inbound);
                }
                Err(status) if self.options.wait_for_ready && status.code() == Code::Unavailable => {
                    tracing::debug!(path = %self.path, error = %status.message(), "server unavailable, waiting for ready");
                    tokio::select! {
                        biased;
                        status = cancelled(&mut self.cancel) => return Err(status),
                        _ = tokio::time::sleep(WAIT_FOR_READY_RETRY_INTERVAL) => {}
                    }
                }
                Err(status) => return Err(status),
            }
        }
    }

    /// Read messages until the stream ends, handing each to the listener once
    /// a pull credit is available.
    async fn read(&mut self, mut inbound: Streaming<Bytes>) -> (Status, MetadataMap) {
        loop {
            let message = tokio::select! {
                biased;
                status = cancelled(&mut self.cancel) => return (status, MetadataMap::new()),
                message = inbound.message() => message,
            };

            let message = match message {
                Ok(Some(message)) => message,
                Ok(None) => {
                    let trailers = inbound.trailers().await.ok().flatten().unwrap_or_default();
                    return (Status::ok(""), trailers);
                }
                Err(status) => return (status, MetadataMap::new()),
            };

            tokio::select! {
                biased;
                status = cancelled(&mut self.cancel) => return (status, MetadataMap::new()),
                permit = self.credits.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => return (Status::internal("pull credits closed"), MetadataMap::new()),
                },
            }
            self.listener.on_message(message);
        }
    }
}

/// Resolves once the call is cancelled, or once the owning [`TonicCall`] has
/// been dropped.
async fn cancelled(cancel: &mut watch::Receiver<Option<Status>>) -> Status {
    match cancel.wait_for(Option::is_some).await {
        Ok(status) => {
            let status: Option<Status> = (*status).clone();
            status.unwrap_or_else(|| Status::cancelled("call cancelled"))
        }
        Err(_) => Status::cancelled("call dropped"),
    }
}

/// The request body: drains the write queue and reports when it falls back
/// under the ready threshold.
fn outbound(
    writes: Arc<WriteQueue>,
    listener: Arc<dyn CallListener>,
) -> impl Stream<Item = Bytes> + Send + 'static {
    async_stream::stream! {
        loop {
            let next = writes.rx.lock().await.recv().await;
            let Some(message) = next else {
                break;
            };
            if writes.taken(message.len()) {
                listener.on_ready();
            }
            yield message;
        }
    }
}
