//! Error types for the decryption addon client.

use thiserror::Error;

/// Addon client error type.
#[derive(Debug, Error)]
pub enum MitmError {
    /// No active binding to the addon service.
    #[error("not connected to the addon service")]
    NotConnected,

    /// The addon service could not be bound.
    #[error("failed to bind addon service: {0}")]
    BindFailed(String),

    /// A message could not be delivered over the binding.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// Creating the proxy socket pair failed.
    #[error("failed to create socket pair: {0}")]
    SocketPair(#[from] std::io::Error),

    /// Config serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// CA error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate the CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read the CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to write the CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Certificate install error type.
#[derive(Debug, Error)]
pub enum InstallError {
    /// No install mechanism exists on this system.
    #[error("no certificate install handler available")]
    NoHandler,

    /// The platform version does not support this install path.
    #[error("certificate install not supported on API level {0}")]
    Unsupported(u32),

    /// The user dismissed the privilege prompt.
    #[error("authentication cancelled by user")]
    Cancelled,

    /// The install command ran and failed.
    #[error("certificate install failed: {0}")]
    Failed(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    /// Returns true if the error means the install path is unavailable,
    /// as opposed to an attempt that ran and failed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NoHandler | Self::Unsupported(_))
    }
}

/// Result type for addon client operations.
pub type Result<T> = std::result::Result<T, MitmError>;
