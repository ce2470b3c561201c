//! Protocol constants for the TETHER wire protocol.
//!
//! These values are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// BANNER & VERSIONS
// =============================================================================

/// Banner exchanged by both sides before any structured data.
pub const BANNER: &[u8] = b"tether v027";

/// Length of [`BANNER`] on the wire.
pub const BANNER_LEN: usize = BANNER.len();

/// Default protocol version spoken between daemons of the same type.
pub const CLUSTER_PROTOCOL_VERSION: u32 = 9;

/// Default protocol version spoken with any other peer type.
pub const PUBLIC_PROTOCOL_VERSION: u32 = 24;

// =============================================================================
// TAGS
// =============================================================================

/// Single-byte tags used both as handshake reply codes and stream markers.
pub mod tags {
    /// Handshake: accepted, session open.
    pub const READY: u8 = 1;
    /// Handshake: reset session, retry with `connect_seq = 0`.
    pub const RESETSESSION: u8 = 2;
    /// Handshake: connection race lost, wait for peer.
    pub const WAIT: u8 = 3;
    /// Handshake: retry with a larger `connect_seq`.
    pub const RETRY_SESSION: u8 = 4;
    /// Handshake: retry with a larger `global_seq`.
    pub const RETRY_GLOBAL: u8 = 5;
    /// Stream: graceful close.
    pub const CLOSE: u8 = 6;
    /// Stream: message frame follows.
    pub const MSG: u8 = 7;
    /// Stream: cumulative acknowledgment (le64 sequence follows).
    pub const ACK: u8 = 8;
    /// Stream: keepalive, no payload.
    pub const KEEPALIVE: u8 = 9;
    /// Handshake: protocol version mismatch.
    pub const BADPROTOVER: u8 = 10;
    /// Handshake: authorizer rejected.
    pub const BADAUTHORIZER: u8 = 11;
    /// Handshake: required features missing.
    pub const FEATURES: u8 = 12;
    /// Handshake: accepted, exchange acked sequence numbers first.
    pub const SEQ: u8 = 13;
}

// =============================================================================
// FEATURE BITS
// =============================================================================

/// Negotiable feature bits carried in the connect request and reply.
pub mod features {
    /// Compact message header without inline source address.
    pub const NOSRCADDR: u64 = 1 << 1;
    /// `SEQ` reply with acked-sequence exchange on reconnect.
    pub const RECONNECT_SEQ: u64 = 1 << 6;
    /// Message signing when a signing authorizer protocol is negotiated.
    pub const MSG_AUTH: u64 = 1 << 13;

    /// Everything this implementation understands.
    pub const SUPPORTED_DEFAULT: u64 = NOSRCADDR | RECONNECT_SEQ | MSG_AUTH;
    /// Nothing required by default.
    pub const REQUIRED_DEFAULT: u64 = 0;
}

// =============================================================================
// CONNECT FLAGS
// =============================================================================

/// Connect request/reply flag: the channel is lossy.
pub const CONNECT_FLAG_LOSSY: u8 = 1;

// =============================================================================
// AUTHORIZER PROTOCOLS
// =============================================================================

/// No authorizer presented.
pub const AUTH_PROTOCOL_NONE: u32 = 1;

/// Shared cluster key authorizer; messages are signed under this protocol.
pub const AUTH_PROTOCOL_SHARED_KEY: u32 = 2;

// =============================================================================
// FOOTER FLAGS
// =============================================================================

/// Footer flag: the sender finished writing the message.
pub const FOOTER_COMPLETE: u8 = 1;

/// Footer flag: section CRCs were not computed.
pub const FOOTER_NOCRC: u8 = 2;

// =============================================================================
// PRIORITIES
// =============================================================================

/// Lowest message priority.
pub const PRIO_LOW: u8 = 64;

/// Default message priority.
pub const PRIO_DEFAULT: u8 = 127;

/// High message priority.
pub const PRIO_HIGH: u8 = 196;

/// Highest message priority; requeued messages go here.
pub const PRIO_HIGHEST: u8 = 255;

// =============================================================================
// SEQUENCES & BUFFERS
// =============================================================================

/// Upper bound for the randomised initial outbound sequence.
pub const MAX_SEQ_START: u64 = 1 << 31;

/// Page size used to lay out freshly allocated data buffers.
pub const PAGE_SIZE: usize = 4096;

/// Largest section accepted from the wire (front, middle or data).
pub const MAX_SECTION_LEN: u32 = 1 << 30;

/// Largest whole message accepted from the wire. The dispatch budget, when
/// smaller, caps it further.
pub const MAX_MESSAGE_LEN: u64 = 256 << 20;

/// Largest authorizer blob accepted during the handshake.
pub const MAX_AUTHORIZER_LEN: u32 = 64 * 1024;

// =============================================================================
// TIMING
// =============================================================================

/// Default socket read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(900);

/// Default first reconnect backoff.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Default reconnect backoff ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Default process-wide dispatch throttle budget.
pub const DEFAULT_DISPATCH_THROTTLE_BYTES: u64 = 100 << 20;
