//! TETHER Protocol - Transport Layer
//!
//! Everything below the pipe state machine:
//!
//! - **Addresses**: [`PeerAddress`] and [`EntityName`] with their wire forms
//! - **Handshake structures**: [`ConnectRequest`] and [`ConnectReply`]
//! - **Message framing**: [`FrameEncoder`] / [`FrameDecoder`] with CRCs and signatures
//! - **Sockets**: [`SocketReader`] / [`SocketWriter`] bounded by timeout and kill switch
//! - **Throttling**: [`ByteThrottle`] and [`ThrottleReservation`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Messenger / Pipes              │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   framing, handshake wire, sockets      │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod addr;
mod error;
mod frame;
mod message;
mod socket;
mod throttle;
mod wire;

pub use addr::*;
pub use error::*;
pub use frame::*;
pub use message::Message;
pub use socket::*;
pub use throttle::{ByteThrottle, ThrottleReservation};
pub use wire::*;
