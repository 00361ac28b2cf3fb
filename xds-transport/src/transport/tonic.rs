//! `tonic` based transport factory.

use std::sync::Arc;

use tokio::runtime::Handle;
use tonic::transport::Endpoint;

use crate::channel::tonic::TonicChannel;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::transport::{ChannelCredentials, ServerDescriptor, Transport, TransportFactory};

/// Creates [`Transport`]s backed by tonic channels.
///
/// Connections are established lazily on the first call, so
/// [`create`](TransportFactory::create) never waits on the network.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use xds_transport::{ServerDescriptor, TonicTransportFactory, TransportConfig, TransportFactory};
///
/// let factory = TonicTransportFactory::new(
///     TransportConfig::default().with_keep_alive_interval(Duration::from_secs(60)),
/// );
/// let transport = factory.create(&ServerDescriptor::insecure("xds.example.com:18000"))?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TonicTransportFactory {
    config: TransportConfig,
    handle: Option<Handle>,
}

impl TonicTransportFactory {
    /// Create a factory that applies `config` to every transport.
    ///
    /// Calls are driven on the Tokio runtime that is current when
    /// [`create`](TransportFactory::create) runs, unless a handle is set with
    /// [`with_handle`](Self::with_handle).
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    /// Drive connections and calls on the runtime behind `handle`.
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// The configuration applied to created transports.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn endpoint(&self, server: &ServerDescriptor) -> Result<Endpoint> {
        let uri = with_scheme(server);
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Error::InvalidArgument(format!("invalid server target '{uri}': {e}")))?
            .http2_keep_alive_interval(self.config.keep_alive_interval)
            .keep_alive_timeout(self.config.keep_alive_timeout)
            .keep_alive_while_idle(self.config.keep_alive_while_idle);

        if let Some(timeout) = self.config.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }

        match server.credentials() {
            ChannelCredentials::Insecure => {}
            #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
            ChannelCredentials::Tls(tls) => {
                endpoint = endpoint.tls_config(tls.clone()).map_err(|e| {
                    Error::InvalidArgument(format!("invalid TLS configuration: {e}"))
                })?;
            }
        }

        Ok(endpoint)
    }
}

impl TransportFactory for TonicTransportFactory {
    fn create(&self, server: &ServerDescriptor) -> Result<Transport> {
        server.validate()?;

        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?,
        };
        let endpoint = self.endpoint(server)?;

        // The lazy channel spawns its connection worker on the current runtime.
        let channel = {
            let _guard = handle.enter();
            endpoint.connect_lazy()
        };

        tracing::debug!(
            server = server.target(),
            keep_alive = ?self.config.keep_alive_interval,
            "created xDS transport"
        );

        let channel = TonicChannel::new(channel, handle, self.config.on_ready_threshold);
        Ok(Transport::new(
            server.target(),
            Arc::new(channel),
            self.config.call_options,
        ))
    }
}

/// Targets are often written as `host:port`; tonic needs a URI with a scheme.
fn with_scheme(server: &ServerDescriptor) -> String {
    let target = server.target().trim();
    if target.contains("://") {
        return target.to_owned();
    }
    match server.credentials() {
        ChannelCredentials::Insecure => format!("http://{target}"),
        #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
        ChannelCredentials::Tls(_) => format!("https://{target}"),
    }
}
