//! Trust synchronization error types.

use thiserror::Error;
use trustgate_authn::AuthError;

/// Errors raised by the discovery stream.
///
/// Every variant is recoverable: the client reports it, NACKs when it
/// interrupts an update, and the scheduler reconnects.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The channel to the control plane could not be established.
    #[error("Failed to connect to {endpoint}: {message}")]
    Connect {
        /// Control-plane endpoint.
        endpoint: String,
        /// Underlying failure.
        message: String,
    },

    /// The stream failed with a gRPC status.
    #[error("Discovery stream failed: {0}")]
    Status(#[from] tonic::Status),

    /// The stream ended or the request channel closed.
    #[error("Discovery stream closed")]
    StreamClosed,

    /// A resource in an update could not be decoded.
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Decoded issuers could not be installed.
    #[error("Failed to install issuers: {0}")]
    Install(#[from] AuthError),

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The client was shut down.
    #[error("Discovery client is shut down")]
    Shutdown,
}

impl SyncError {
    /// Shorthand for [`SyncError::Connect`].
    pub fn connect(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Connect { endpoint: endpoint.into(), message: message.to_string() }
    }

    /// Shorthand for [`SyncError::InvalidResource`].
    pub fn invalid_resource(msg: impl Into<String>) -> Self {
        SyncError::InvalidResource(msg.into())
    }

    /// gRPC status code carried in a NACK for this error.
    pub fn nack_code(&self) -> i32 {
        match self {
            SyncError::InvalidResource(_) | SyncError::Install(_) => {
                tonic::Code::InvalidArgument as i32
            },
            SyncError::Status(status) => status.code() as i32,
            _ => tonic::Code::Internal as i32,
        }
    }
}

/// Result type alias for trust synchronization.
pub type Result<T> = std::result::Result<T, SyncError>;
