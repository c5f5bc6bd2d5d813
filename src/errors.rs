//! Error types for eewcast.
//!
//! Uses `thiserror` for library-style error definitions.

use thiserror::Error;

/// Errors that can occur in eewcast operations.
#[derive(Error, Debug)]
pub enum EewcastError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport failed
    #[error("WebSocket transport failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON parsing failed
    #[error("Failed to parse JSON: {0}")]
    Decode(#[from] serde_json::Error),

    /// API returned an error status
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Credentials rejected by the upstream; terminal for WebSocket mode
    #[error("Authorization failed: {0}")]
    AuthFailed(String),

    /// Malformed or unexpected frame from the upstream
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Bulletin failed structural validation
    #[error("Invalid bulletin data: {0}")]
    Validation(String),

    /// The per-alert intensity computation failed
    #[error("Intensity computation failed: {0}")]
    Computation(String),

    /// A required static asset is missing or unreadable
    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    /// The configuration file is missing, unreadable or inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl EewcastError {
    /// Whether this error is recoverable by retry or node switching.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::WebSocket(_) | Self::Api { .. })
    }
}
