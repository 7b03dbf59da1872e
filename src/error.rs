//! Error types for the RFB server library.

use std::io;
use thiserror::Error;

/// Result type for RFB server operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur in RFB server operations.
///
/// Every error is scoped to a single connection; the supervisor never
/// propagates a session failure to its siblings.
#[derive(Debug, Error)]
pub enum VncError {
    /// Transport-level I/O error (socket read/write, EOF, timeout).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed RFB message, unknown message type, or oversized field.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// VNC challenge-response mismatch.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// WebSocket upgrade failure.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    /// Client requested a pixel format the server cannot serve.
    #[error("Invalid pixel format")]
    InvalidPixelFormat,

    /// Inconsistency inside an encoder; the caller falls back to Raw.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A per-connection buffer or message limit was exceeded.
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(&'static str),

    /// The screen source reported an unrecoverable failure.
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// Peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl VncError {
    /// True for errors that end the session without being worth more
    /// than an INFO-level log line.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, VncError::Io(_) | VncError::ConnectionClosed)
    }
}
