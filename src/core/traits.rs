//! Collaborator interfaces consumed by the messaging core.
//!
//! The pipe engine never decides what to do with application data, how to
//! authenticate a peer, or how to sign a frame. It calls out through these
//! traits instead. Default implementations live in [`crate::crypto`] and
//! [`crate::transport::ByteThrottle`].

use std::sync::Arc;

use async_trait::async_trait;

use super::secret::SessionSecret;
use crate::pipe::ConnectionIdentity;
use crate::transport::Message;

/// Receives decoded messages and connection lifecycle notifications.
///
/// Calls are made from reader/writer tasks and must not block for long.
pub trait DispatchSink: Send + Sync + 'static {
    /// A message arrived in order on `message.connection()`.
    fn deliver(&self, message: Message, priority: u8);

    /// A lossy connection failed; its queued messages were discarded.
    fn notify_reset(&self, identity: &Arc<ConnectionIdentity>);

    /// The peer reset its session; messages in flight may have been lost.
    fn notify_remote_reset(&self, identity: &Arc<ConnectionIdentity>);

    /// An outgoing connection completed its handshake.
    fn notify_connected(&self, identity: &Arc<ConnectionIdentity>);
}

/// An authorizer presented by the connecting side.
#[derive(Debug, Clone)]
pub struct Authorizer {
    /// Authorizer protocol id sent in the connect request.
    pub protocol: u32,
    /// Opaque blob sent after the connect request.
    pub blob: Vec<u8>,
    /// Secret both sides will use to sign messages.
    pub session_secret: SessionSecret,
    /// Provider-private state used to check the accept side's reply.
    pub challenge: Vec<u8>,
}

/// Result of checking a peer's authorizer on the accept side.
#[derive(Debug, Clone)]
pub struct AuthVerdict {
    /// Whether the authorizer is acceptable.
    pub valid: bool,
    /// Blob to send back with the reply.
    pub reply: Vec<u8>,
    /// Session secret recovered from the authorizer, if any.
    pub session_secret: Option<SessionSecret>,
}

impl AuthVerdict {
    /// A verdict that accepts without a reply or secret.
    pub fn accept() -> Self {
        Self {
            valid: true,
            reply: Vec::new(),
            session_secret: None,
        }
    }

    /// A verdict that rejects.
    pub fn reject() -> Self {
        Self {
            valid: false,
            reply: Vec::new(),
            session_secret: None,
        }
    }
}

/// Produces and verifies authorizers for the handshake.
pub trait AuthorizerProvider: Send + Sync + 'static {
    /// Build an authorizer for a peer of `peer_type`.
    ///
    /// `retry` is set after the peer rejected a first attempt; providers
    /// should refresh whatever credentials they hold.
    fn produce(&self, peer_type: u32, retry: bool) -> Option<Authorizer>;

    /// Check an authorizer presented by a peer of `peer_type`.
    fn verify(&self, peer_type: u32, protocol: u32, blob: &[u8]) -> AuthVerdict;

    /// Check the accept side's reply to an authorizer we produced.
    fn verify_reply(&self, authorizer: &Authorizer, reply: &[u8]) -> bool;
}

/// Two 32-bit signature words carried in the frame footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signature {
    /// First signature word.
    pub sig1: u32,
    /// Second signature word.
    pub sig2: u32,
}

/// Computes and checks message signatures keyed by a session secret.
pub trait CryptoService: Send + Sync + 'static {
    /// Sign `plaintext` under `secret`.
    fn sign(&self, secret: &SessionSecret, plaintext: &[u8]) -> Signature;

    /// Check `signature` over `plaintext` under `secret`.
    fn verify(&self, secret: &SessionSecret, plaintext: &[u8], signature: Signature) -> bool {
        self.sign(secret, plaintext) == signature
    }
}

/// A byte budget shared by concurrent readers.
#[async_trait]
pub trait Throttle: Send + Sync + std::fmt::Debug + 'static {
    /// Reserve `n` bytes, waiting until they are available.
    ///
    /// Returns `true` if the caller had to wait.
    async fn acquire(&self, n: u64) -> bool;

    /// Return `n` previously reserved bytes.
    fn release(&self, n: u64);

    /// Bytes currently reserved.
    fn current(&self) -> u64;

    /// Total budget.
    fn max(&self) -> u64;
}

/// Authorizer provider that presents nothing and accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthorizerProvider for NoAuth {
    fn produce(&self, _peer_type: u32, _retry: bool) -> Option<Authorizer> {
        None
    }

    fn verify(&self, _peer_type: u32, _protocol: u32, _blob: &[u8]) -> AuthVerdict {
        AuthVerdict::accept()
    }

    fn verify_reply(&self, _authorizer: &Authorizer, _reply: &[u8]) -> bool {
        true
    }
}
