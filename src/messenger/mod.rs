//! TETHER messenger - application-facing API.
//!
//! A [`Messenger`] listens for incoming pipes, opens outgoing ones on
//! demand, and keeps the registry that guarantees at most one pipe per
//! peer address.

mod config;
#[allow(clippy::module_inception)]
mod messenger;
mod shared;

pub use config::{MessengerConfig, MessengerConfigBuilder};
pub use messenger::Messenger;

pub(crate) use shared::{Registry, Shared};
