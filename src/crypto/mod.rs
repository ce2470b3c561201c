//! Default authorizer and signing implementations.
//!
//! - [`SharedKeyAuthorizer`]: pre-shared-key authorizer deriving a session secret
//! - [`Blake2Signer`]: keyed BLAKE2s footer signatures
//!
//! Both plug into the pipe engine through the traits in [`crate::core`];
//! applications with their own authentication scheme can skip this module.

mod authorizer;
mod signer;

pub use authorizer::{AUTH_NONCE_SIZE, AUTH_TAG_SIZE, SESSION_SECRET_SIZE, SharedKeyAuthorizer};
pub use signer::Blake2Signer;
