//! Command channel error types.

use std::time::Duration;
use thiserror::Error;

/// Command channel errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The byte stream no longer lines up with frame boundaries.
    #[error("Protocol desync: {0}")]
    Desync(String),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the stream that produced this error can no longer be trusted.
    ///
    /// Framing errors are unrecoverable: there is no resynchronization marker
    /// in the wire format, so the owning process must exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Desync(_) | ProtocolError::PayloadTooLarge { .. } | ProtocolError::Io(_)
        )
    }
}
