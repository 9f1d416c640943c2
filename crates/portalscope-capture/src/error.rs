//! Error types for capture control.

use std::net::SocketAddr;

use thiserror::Error;

/// Capture control error type.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture process could not be resolved by the dispatcher.
    #[error("capture app not found: {0}")]
    TargetNotFound(String),

    /// Dispatching a command failed for another reason.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The telemetry port is already bound.
    #[error("telemetry port {0} is already in use")]
    PortInUse(SocketAddr),

    /// Binding the telemetry socket failed.
    #[error("failed to bind telemetry socket on {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// No async runtime is available to host the listener.
    #[error("no async runtime available for the telemetry listener")]
    NoRuntime,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Returns a short message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            Self::TargetNotFound(_) => "Capture app is not installed".to_string(),
            Self::Dispatch(_) => "Could not reach the capture app".to_string(),
            Self::PortInUse(addr) => format!("Port {} is already in use", addr.port()),
            Self::Bind(addr, _) => format!("Could not listen on {}", addr),
            Self::NoRuntime | Self::Io(_) => "Internal error starting the listener".to_string(),
        }
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
