//! Error types for the share link stack.
//!
//! All errors implement `std::error::Error` and carry structured context.
//! Most of the link layer fails *silently* by design (foreign traffic on a
//! shared bus is expected), so errors here surface only at the seams where a
//! caller can act on them: transport I/O, handshakes, and envelope parsing.
//!
//! ## Recovery
//!
//! ```rust
//! use sharelink::LinkError;
//!
//! let error = LinkError::transport_failed("device unplugged");
//! if error.is_retryable() {
//!     // reconnect and try again
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for share link operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Main error type for share link operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("Transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Frame length {actual} is not {expected} bytes")]
    FrameLength { expected: usize, actual: usize },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Device '{device_id}' is not connected")]
    NotConnected { device_id: String },

    #[error("Handshake with '{device_id}' failed: {reason}")]
    Handshake { device_id: String, reason: String },

    #[error("Connection to '{device_id}' is closed")]
    Closed { device_id: String },
}

impl LinkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Transport { .. } => true,
            LinkError::Timeout { .. } => true,
            LinkError::Handshake { .. } => true,
            LinkError::FrameLength { .. } => false,
            LinkError::Parse { .. } => false,
            LinkError::NotConnected { .. } => false,
            LinkError::Closed { .. } => false,
        }
    }

    /// Helper constructor for transport errors.
    pub fn transport_failed(reason: impl Into<String>) -> Self {
        LinkError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for frame length errors.
    pub fn frame_length(actual: usize) -> Self {
        LinkError::FrameLength { expected: crate::frame::FRAME_SIZE, actual }
    }

    /// Helper constructor for parse errors.
    pub fn parse_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        LinkError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for handshake failures.
    pub fn handshake_failed(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        LinkError::Handshake { device_id: device_id.into(), reason: reason.into() }
    }

    /// Helper constructor for unconnected device errors.
    pub fn not_connected(device_id: impl Into<String>) -> Self {
        LinkError::NotConnected { device_id: device_id.into() }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Transport { reason: "I/O error".to_string(), source: Some(Box::new(err)) }
    }
}
