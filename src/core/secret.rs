//! Per-connection session secret.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session secret negotiated by the authorizer.
///
/// Zeroized on drop. `Debug` never prints the key material.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret(Vec<u8>);

impl SessionSecret {
    /// Wrap raw key material.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether no secret has been negotiated.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionSecret({} bytes)", self.0.len())
    }
}
