//! Transport layer error types.

use std::io;

use thiserror::Error;

use super::frame::FrameError;
use crate::core::WireError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Handshake structure decoding error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A socket read or write did not complete in time.
    #[error("socket operation timed out")]
    Timeout,

    /// The socket was shut down while an operation was in flight.
    #[error("socket shut down")]
    Aborted,

    /// Peer closed the stream.
    #[error("connection closed by peer")]
    Closed,
}

impl TransportError {
    /// Check if this error is an integrity failure (CRC or signature).
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, TransportError::Frame(e) if e.is_integrity_failure())
    }

    /// Check if this error was caused by a local shutdown rather than the peer.
    pub fn is_local_shutdown(&self) -> bool {
        matches!(self, TransportError::Aborted)
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
