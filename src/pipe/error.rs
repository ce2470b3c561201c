//! Handshake error types.

use thiserror::Error;

use crate::transport::{PeerAddress, TransportError};

/// Errors that end a handshake attempt.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Peer did not send our banner.
    #[error("peer sent bad banner {0:?}")]
    BadBanner(Vec<u8>),

    /// Peer claims to be someone other than the node we dialled.
    #[error("connected to {actual}, expected {expected}")]
    WrongPeer {
        /// Address we dialled.
        expected: PeerAddress,
        /// Address the peer declared.
        actual: PeerAddress,
    },

    /// Protocol versions differ.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    ProtocolVersion {
        /// Our version.
        ours: u32,
        /// Peer's version.
        theirs: u32,
    },

    /// Peer lacks features we require (or we lack features it requires).
    #[error("missing required features {missing:#x}")]
    MissingFeatures {
        /// Missing feature bits.
        missing: u64,
    },

    /// Peer rejected our authorizer twice.
    #[error("authorizer rejected")]
    AuthorizerRejected,

    /// Peer's authorizer reply did not verify.
    #[error("bad authorizer reply")]
    BadReplyAuthorizer,

    /// Authorizer blob longer than we accept.
    #[error("authorizer too large: {0} bytes")]
    AuthorizerTooLarge(u32),

    /// Reply tag we do not understand.
    #[error("unknown reply tag {0}")]
    UnknownTag(u8),

    /// Messenger is shutting down.
    #[error("messenger shutting down")]
    ShuttingDown,

    /// The pipe left `CONNECTING` while we were talking to the peer.
    #[error("pipe no longer connecting")]
    NoLongerConnecting,

    /// Socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    /// Whether the peer broke the protocol (as opposed to I/O trouble).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            HandshakeError::BadBanner(_)
                | HandshakeError::WrongPeer { .. }
                | HandshakeError::ProtocolVersion { .. }
                | HandshakeError::MissingFeatures { .. }
                | HandshakeError::AuthorizerTooLarge(_)
                | HandshakeError::UnknownTag(_)
        )
    }

    /// Whether authentication failed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            HandshakeError::AuthorizerRejected | HandshakeError::BadReplyAuthorizer
        )
    }
}

impl From<crate::core::WireError> for HandshakeError {
    fn from(e: crate::core::WireError) -> Self {
        HandshakeError::Transport(TransportError::Wire(e))
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        HandshakeError::Transport(TransportError::Io(e))
    }
}

/// Result type for handshake operations.
pub type HandshakeResult<T> = Result<T, HandshakeError>;
