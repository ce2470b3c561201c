//! # TETHER Protocol
//!
//! **T**CP **E**ndpoint **T**ransport with **H**andshake, **E**pochs and
//! **R**eplay
//!
//! TETHER binds the nodes of a cluster into a reliable, ordered,
//! at-most-once messaging fabric over TCP. Each peer connection is a
//! *pipe* that owns one socket at a time, but whose identity, sequence
//! counters, and queued messages survive socket loss, peer restarts, and
//! simultaneous-connect races.
//!
//! - **Reliability**: every message is acknowledged; unacknowledged
//!   messages are replayed after a reconnect
//! - **Ordering**: per-peer order is preserved across reconnects
//! - **Races**: two nodes connecting to each other end up with one pipe
//! - **Integrity**: CRC32 over header and sections, optional signatures
//! - **Flow control**: byte budgets on received-but-undispatched messages
//!
//! ## Feature Flags
//!
//! - `crypto` (default): shared-key authorizer and BLAKE2s message signer
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, and collaborator traits
//! - [`transport`]: addresses, handshake structures, frame codec, sockets
//! - [`pipe`]: the pipe state machine, handshakes, fault handling
//! - [`messenger`]: listener, registry, and application-facing API
//! - [`crypto`]: default authorizer and signer (requires `crypto` feature)
//!
//! ## Example Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_protocol::prelude::*;
//!
//! struct Printer;
//!
//! impl DispatchSink for Printer {
//!     fn deliver(&self, message: Message, _priority: u8) {
//!         println!("got {message}");
//!     }
//!     fn notify_reset(&self, _identity: &Arc<ConnectionIdentity>) {}
//!     fn notify_remote_reset(&self, _identity: &Arc<ConnectionIdentity>) {}
//!     fn notify_connected(&self, _identity: &Arc<ConnectionIdentity>) {}
//! }
//!
//! let config = MessengerConfigBuilder::new()
//!     .bind_addr("127.0.0.1:6800".parse()?)
//!     .entity(EntityName::new(entity_type::OSD, 0))
//!     .build()?;
//! let messenger = Messenger::bind(config, Arc::new(Printer)).await?;
//! messenger.send_message(peer, entity_type::OSD, Message::new(42, "ping"))?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire structures, frame codec, sockets
pub mod transport;

// Pipe state machine
pub mod pipe;

// Application-facing API
pub mod messenger;

// Default authorizer and signer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits, constants, errors
    pub use crate::core::*;

    pub use crate::messenger::{Messenger, MessengerConfig, MessengerConfigBuilder};
    pub use crate::pipe::{
        ConnectionIdentity, HandshakeError, PipeState, PipeStats, Policy, SequenceState,
    };
    pub use crate::transport::{
        ByteThrottle, EntityName, Message, PeerAddress, TransportError, TransportResult,
        entity_type,
    };

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{Blake2Signer, SharedKeyAuthorizer};
}

// Re-export commonly used items at crate root
pub use crate::core::{DispatchSink, MessengerError};
pub use crate::messenger::{Messenger, MessengerConfig, MessengerConfigBuilder};
pub use crate::pipe::{ConnectionIdentity, Policy};
pub use crate::transport::{EntityName, Message, PeerAddress};
