//! Durable per-peer connection identity.
//!
//! A [`ConnectionIdentity`] outlives individual sockets and pipes. It is
//! what the dispatch sink sees: messages carry it, notifications name it,
//! and it keeps the negotiated features and session secret across
//! reconnects and accept-side replacement.
//!
//! The identity only holds a weak reference to its current pipe; pipes own
//! a strong reference to their identity, so there is no ownership cycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::BytesMut;

use super::Pipe;
use crate::core::{AUTH_PROTOCOL_SHARED_KEY, SessionSecret, features};
use crate::transport::{PeerAddress, RxBufferPool};

#[derive(Debug, Default)]
struct Negotiated {
    peer_type: u32,
    features: u64,
    secret: SessionSecret,
    protocol: u32,
    pipe: Weak<Pipe>,
}

/// Identity of the connection to one peer address.
#[derive(Debug)]
pub struct ConnectionIdentity {
    peer_addr: PeerAddress,
    negotiated: Mutex<Negotiated>,
    rx_buffers: RxBufferPool,
}

impl ConnectionIdentity {
    /// Create an identity for `peer_addr` with nothing negotiated yet.
    pub fn new(peer_addr: PeerAddress) -> Self {
        Self {
            peer_addr,
            negotiated: Mutex::new(Negotiated::default()),
            rx_buffers: RxBufferPool::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Negotiated> {
        self.negotiated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Peer address this identity names.
    pub fn peer_addr(&self) -> PeerAddress {
        self.peer_addr
    }

    /// Peer's entity type, as declared in the handshake.
    pub fn peer_type(&self) -> u32 {
        self.lock().peer_type
    }

    pub(crate) fn set_peer_type(&self, peer_type: u32) {
        self.lock().peer_type = peer_type;
    }

    /// Negotiated feature mask.
    pub fn features(&self) -> u64 {
        self.lock().features
    }

    /// Whether every bit of `feature` was negotiated.
    pub fn has_feature(&self, feature: u64) -> bool {
        self.features() & feature == feature
    }

    /// Authorizer protocol in use.
    pub fn protocol(&self) -> u32 {
        self.lock().protocol
    }

    /// Session secret (empty if none was negotiated).
    pub fn session_secret(&self) -> SessionSecret {
        self.lock().secret.clone()
    }

    /// Record the outcome of a handshake.
    pub fn set_negotiated(&self, features: u64, secret: Option<SessionSecret>, protocol: u32) {
        let mut n = self.lock();
        n.features = features;
        n.protocol = protocol;
        if let Some(secret) = secret {
            n.secret = secret;
        }
    }

    /// Update only the feature mask.
    pub fn set_features(&self, features: u64) {
        self.lock().features = features;
    }

    /// Secret to sign frames with, when signing is in effect.
    ///
    /// Signing is on when the shared-key protocol was used, the peer
    /// negotiated `MSG_AUTH`, and a secret was actually derived.
    pub fn signing_secret(&self) -> Option<SessionSecret> {
        let n = self.lock();
        let active = n.protocol == AUTH_PROTOCOL_SHARED_KEY
            && n.features & features::MSG_AUTH != 0
            && !n.secret.is_empty();
        active.then(|| n.secret.clone())
    }

    /// Pipe currently carrying this connection.
    pub fn pipe(&self) -> Option<Arc<Pipe>> {
        self.lock().pipe.upgrade()
    }

    /// Point this identity at `pipe`.
    pub fn rebind(&self, pipe: &Arc<Pipe>) {
        self.lock().pipe = Arc::downgrade(pipe);
    }

    /// Forget `pipe` if it is still the current one.
    pub(crate) fn clear_pipe(&self, pipe: &Pipe) {
        let mut n = self.lock();
        if std::ptr::eq(n.pipe.as_ptr(), pipe) {
            n.pipe = Weak::new();
        }
    }

    /// Post a buffer that the data section of the reply carrying `tid`
    /// will be read into.
    pub fn post_rx_buffer(&self, tid: u64, buf: BytesMut) {
        tracing::debug!(peer = %self.peer_addr, tid, capacity = buf.capacity(), "post rx buffer");
        self.rx_buffers.post(tid, buf);
    }

    /// Withdraw a posted buffer that was not consumed.
    pub fn revoke_rx_buffer(&self, tid: u64) -> Option<BytesMut> {
        tracing::debug!(peer = %self.peer_addr, tid, "revoke rx buffer");
        self.rx_buffers.revoke(tid)
    }

    pub(crate) fn rx_buffers(&self) -> &RxBufferPool {
        &self.rx_buffers
    }
}
