//! Keyed BLAKE2s message signatures.
//!
//! The footer has room for two 32-bit words, so the signature is the first
//! eight bytes of `BLAKE2s-MAC(session_secret, plaintext)`.

use blake2::digest::{KeyInit, Mac};
use blake2::{Blake2s256, Blake2sMac256, Digest};
use zeroize::Zeroize;

use crate::core::{CryptoService, SessionSecret, Signature};

/// Key size of `Blake2sMac256`.
const MAC_KEY_SIZE: usize = 32;

/// Build a MAC keyed by `key`.
///
/// Keys of exactly 32 bytes are used as-is; anything else is first hashed
/// down to 32 bytes with BLAKE2s.
pub(crate) fn keyed_mac(key: &[u8]) -> Blake2sMac256 {
    let mut material = [0u8; MAC_KEY_SIZE];
    if key.len() == MAC_KEY_SIZE {
        material.copy_from_slice(key);
    } else {
        material.copy_from_slice(&Blake2s256::digest(key));
    }
    let mac = <Blake2sMac256 as KeyInit>::new(&material.into());
    material.zeroize();
    mac
}

/// [`CryptoService`] signing with keyed BLAKE2s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake2Signer;

impl Blake2Signer {
    /// Create a signer.
    pub fn new() -> Self {
        Self
    }
}

impl CryptoService for Blake2Signer {
    fn sign(&self, secret: &SessionSecret, plaintext: &[u8]) -> Signature {
        let mut mac = keyed_mac(secret.as_bytes());
        mac.update(plaintext);
        let tag = mac.finalize().into_bytes();
        Signature {
            sig1: u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]),
            sig2: u32::from_le_bytes([tag[4], tag[5], tag[6], tag[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_deterministic() {
        let signer = Blake2Signer::new();
        let secret = SessionSecret::from_bytes(vec![1u8; 32]);
        let a = signer.sign(&secret, b"plaintext");
        let b = signer.sign(&secret, b"plaintext");
        assert_eq!(a, b);
        assert!(signer.verify(&secret, b"plaintext", a));
    }

    #[test]
    fn test_sign_depends_on_key_and_text() {
        let signer = Blake2Signer::new();
        let one = SessionSecret::from_bytes(vec![1u8; 32]);
        let two = SessionSecret::from_bytes(vec![2u8; 32]);
        let sig = signer.sign(&one, b"seq 1");
        assert_ne!(sig, signer.sign(&two, b"seq 1"));
        assert_ne!(sig, signer.sign(&one, b"seq 2"));
        assert!(!signer.verify(&two, b"seq 1", sig));
    }

    #[test]
    fn test_long_keys_accepted() {
        let signer = Blake2Signer::new();
        let long = SessionSecret::from_bytes(vec![9u8; 100]);
        let sig = signer.sign(&long, b"x");
        assert!(signer.verify(&long, b"x", sig));
    }
}
