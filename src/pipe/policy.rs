//! Per-peer-type connection policy.

use std::fmt;
use std::sync::Arc;

use crate::core::{Throttle, features};

/// How connections to one class of peer behave.
#[derive(Clone)]
pub struct Policy {
    /// Drop queued messages on failure instead of reconnecting.
    pub lossy: bool,
    /// Never initiate connections; wait for the peer to come back.
    pub server: bool,
    /// Features we advertise.
    pub features_supported: u64,
    /// Features the peer must support.
    pub features_required: u64,
    /// Byte budget for messages received from this class of peer.
    pub throttle: Option<Arc<dyn Throttle>>,
}

impl Policy {
    /// Reliable peer-to-peer channel (both sides reconnect).
    pub fn lossless_peer() -> Self {
        Self {
            lossy: false,
            server: false,
            features_supported: features::SUPPORTED_DEFAULT,
            features_required: features::REQUIRED_DEFAULT,
            throttle: None,
        }
    }

    /// Reliable client: we reconnect, the peer keeps state for us.
    pub fn lossless_client() -> Self {
        Self::lossless_peer()
    }

    /// Lossy client: failures are reported, never retried.
    pub fn lossy_client() -> Self {
        Self {
            lossy: true,
            ..Self::lossless_peer()
        }
    }

    /// Server side of a lossy client: never reconnects, drops on failure.
    pub fn stateless_server() -> Self {
        Self {
            lossy: true,
            server: true,
            ..Self::lossless_peer()
        }
    }

    /// Server side of a reliable client: keeps state, never reconnects.
    pub fn stateful_server() -> Self {
        Self {
            server: true,
            ..Self::lossless_peer()
        }
    }

    /// Attach a byte throttle.
    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Require `bits` from the peer (and advertise them).
    pub fn require(mut self, bits: u64) -> Self {
        self.features_required |= bits;
        self.features_supported |= bits;
        self
    }

    /// Stop advertising `bits`.
    pub fn without(mut self, bits: u64) -> Self {
        self.features_supported &= !bits;
        self.features_required &= !bits;
        self
    }

    /// Required features missing from `offered`.
    pub fn missing_from(&self, offered: u64) -> u64 {
        self.features_required & !offered
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::lossless_peer()
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("lossy", &self.lossy)
            .field("server", &self.server)
            .field("features_supported", &format_args!("{:#x}", self.features_supported))
            .field("features_required", &format_args!("{:#x}", self.features_required))
            .field("throttle", &self.throttle.is_some())
            .finish()
    }
}
