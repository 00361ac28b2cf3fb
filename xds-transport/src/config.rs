//! Configuration for xDS transports and calls.

use std::time::Duration;

/// Default interval between HTTP/2 keep-alive pings.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default time to wait for a keep-alive acknowledgement before closing the connection.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default number of queued outbound bytes at which a call stops reporting ready.
pub const DEFAULT_ON_READY_THRESHOLD: usize = 32 * 1024;

/// Connection-level configuration applied by a [`TransportFactory`](crate::TransportFactory).
///
/// # Example
///
/// ```
/// use xds_transport::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::default()
///     .with_keep_alive_interval(Duration::from_secs(60))
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_wait_for_ready(true);
///
/// assert_eq!(config.keep_alive_interval, Duration::from_secs(60));
/// assert!(config.call_options.wait_for_ready);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between keep-alive probes used to detect dead peers
    /// independently of application traffic.
    ///
    /// Default: 5 minutes.
    pub keep_alive_interval: Duration,

    /// How long to wait for a keep-alive acknowledgement.
    ///
    /// Default: 20 seconds.
    pub keep_alive_timeout: Duration,

    /// Whether keep-alive probes are sent while no calls are active.
    ///
    /// Default: false.
    pub keep_alive_while_idle: bool,

    /// Timeout for establishing the connection.
    ///
    /// Default: None (the connection layer's own default).
    pub connect_timeout: Option<Duration>,

    /// Number of queued, not yet written, outbound bytes at which a call
    /// reports itself as not ready.
    ///
    /// Default: 32 KiB.
    pub on_ready_threshold: usize,

    /// Options applied to every call created by the transport.
    pub call_options: CallOptions,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            keep_alive_while_idle: false,
            connect_timeout: None,
            on_ready_threshold: DEFAULT_ON_READY_THRESHOLD,
            call_options: CallOptions::default(),
        }
    }
}

impl TransportConfig {
    /// Set the keep-alive probe interval.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the keep-alive acknowledgement timeout.
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Send keep-alive probes even while the connection has no active calls.
    pub fn with_keep_alive_while_idle(mut self, enabled: bool) -> Self {
        self.keep_alive_while_idle = enabled;
        self
    }

    /// Set the connection establishment timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the outbound buffer size at which calls stop reporting ready.
    ///
    /// A threshold of zero is raised to one byte so that an idle call is ready.
    pub fn with_on_ready_threshold(mut self, threshold: usize) -> Self {
        self.on_ready_threshold = threshold.max(1);
        self
    }

    /// Set whether calls wait for the connection to become ready instead of
    /// failing fast.
    pub fn with_wait_for_ready(mut self, wait_for_ready: bool) -> Self {
        self.call_options.wait_for_ready = wait_for_ready;
        self
    }
}

/// Per-call options handed to the connection layer when a stream is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// If true, a call started while the connection is unavailable waits for
    /// it to become available. If false, the call fails fast with an
    /// `Unavailable` status.
    ///
    /// Default: false.
    pub wait_for_ready: bool,
}
