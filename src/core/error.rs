//! Error types for TETHER protocol.

use thiserror::Error;

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length for the primitive.
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Authorizer blob is malformed.
    #[error("malformed authorizer: {0}")]
    MalformedAuthorizer(&'static str),
}

/// Errors that can occur when decoding handshake structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unexpected end of data.
    #[error("unexpected end of data: need {expected} bytes, have {actual}")]
    UnexpectedEof {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown address family byte.
    #[error("unknown address family: {0}")]
    BadAddressFamily(u8),
}

/// Top-level messenger errors.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Failed to bind the listening socket.
    #[error("bind failed: {0}")]
    Bind(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Messenger has been shut down.
    #[error("messenger shut down")]
    Shutdown,

    /// No connection to the peer and our policy forbids opening one.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
