//! Core constants, error types, and collaborator traits.

mod constants;
mod error;
mod secret;
mod traits;

pub use constants::*;
pub use error::*;
pub use secret::SessionSecret;
pub use traits::*;
