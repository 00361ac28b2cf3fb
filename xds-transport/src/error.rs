//! Error types for the xDS transport.
//!
//! Only construction and state errors are reported synchronously. Failures of
//! the underlying connection are delivered as a terminal [`tonic::Status`]
//! through [`EventHandler::on_status_received`](crate::EventHandler::on_status_received).

use thiserror::Error;

/// Error type for the xDS transport.
#[derive(Debug, Error)]
pub enum Error {
    /// An argument was empty or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current state of the transport or call.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// No async runtime is available to drive the transport.
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

/// Result type alias for xDS transport operations.
pub type Result<T> = std::result::Result<T, Error>;
