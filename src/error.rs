//! # Error Types
//!
//! Custom error types for the observation node using `thiserror`.
//!
//! Every failure in the capture, delivery and command paths maps onto one
//! variant here. Only [`NodeError::is_fatal`] errors stop the process; the rest
//! are absorbed at the nearest tick, batch or artifact boundary.

use thiserror::Error;

/// Main error type for the observation node
#[derive(Debug, Error)]
pub enum NodeError {
    /// Camera returned no frame (retryable, skip tick)
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Robot state could not be read (retryable, skip tick)
    #[error("Telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    /// Encoded observation does not fit in the scratch buffer
    #[error("Encoded observation too large: {size} bytes exceeds capacity {capacity}")]
    EncodeTooLarge { size: usize, capacity: usize },

    /// HTTP transport error or non-2xx response
    #[error("Network error: {0}")]
    Network(String),

    /// Hardware or format state with no safe degraded mode
    #[error("Fatal configuration error: {0}")]
    ConfigurationFatal(String),

    /// Command bus framing errors
    #[error("Bus protocol error: {0}")]
    BusProtocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Whether the error must abort the process.
    ///
    /// Capture, telemetry, encode, network and I/O failures all have a natural
    /// retry point (next tick, next batch, next spool scan).
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::ConfigurationFatal(_) | NodeError::Config(_))
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        NodeError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Network(format!("Failed to serialize request body: {}", e))
    }
}

/// Result type alias for the observation node
pub type Result<T> = std::result::Result<T, NodeError>;
