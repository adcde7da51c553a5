//! Error types for the host.

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Frame decoding failures.
///
/// Every variant is transport fatal: the connection that produced the frame
/// is destroyed before any payload byte reaches the application.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame declares {declared} payload bytes, limit is {max}")]
    PayloadTooLarge { declared: u64, max: usize },
}

/// Handshake failures. Transport fatal.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Upgrade request is missing Sec-WebSocket-Key")]
    MissingKey,

    #[error("Unsupported Sec-WebSocket-Version: {version}")]
    UnsupportedVersion { version: String },
}
