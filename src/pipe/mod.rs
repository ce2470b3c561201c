//! Pipes: one logical connection to one peer.
//!
//! A pipe owns at most one TCP socket at a time but survives socket loss:
//! its sequence counters, outbound queue, and unacknowledged messages are
//! carried across reconnects, and an accepting pipe can take them over
//! from the pipe it replaces.
//!
//! ```text
//!            submit()                        deliver()
//!               │                                ▲
//!               ▼                                │
//!   ┌───────────────────────┐        ┌───────────────────────┐
//!   │ writer task           │        │ reader task           │
//!   │  connect handshake    │        │  MSG / ACK / CLOSE    │
//!   │  ACK, KEEPALIVE, MSG  │        │  frame decode         │
//!   └───────────┬───────────┘        └───────────▲───────────┘
//!               │        PipeInner (mutex)       │
//!               └──────── + Notify ──────────────┘
//! ```
//!
//! - [`state`]: lifecycle states and sequence counters
//! - [`queue`]: priority queue and sent list
//! - [`policy`]: per-peer-type behaviour
//! - [`identity`]: per-address identity visible to the dispatch sink
//! - `engine`: the pipe itself with its reader and writer tasks
//! - `fault`: fault handling and reconnect backoff
//! - `handshake`: connect and accept, including the race table

mod engine;
mod error;
mod fault;
mod handshake;
pub mod identity;
pub mod policy;
pub mod queue;
pub mod state;

pub use engine::{Pipe, PipeStats};
pub use error::{HandshakeError, HandshakeResult};
pub use identity::ConnectionIdentity;
pub use policy::Policy;
pub use queue::MessageQueues;
pub use state::{PipeState, SequenceState};

pub(crate) use handshake::accept;
