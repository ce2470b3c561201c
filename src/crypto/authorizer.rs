//! Shared-key authorizer.
//!
//! Both ends hold the same pre-shared key. The connecting side proves it by
//! MACing a fresh nonce; the accepting side proves it back by MACing the
//! same nonce under a different label. Both derive the session secret from
//! the key and nonce, so no secret ever crosses the wire.
//!
//! Authorizer blob (48 bytes):
//! ```text
//! +--------------+------------------------------------------+
//! | Nonce (16)   | BLAKE2s-MAC(key, "tether authorize" ‖ n) |
//! +--------------+------------------------------------------+
//! ```
//! Reply blob (32 bytes): `BLAKE2s-MAC(key, "tether reply" ‖ nonce)`.

use blake2::digest::Mac;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use super::signer::keyed_mac;
use crate::core::{
    AUTH_PROTOCOL_SHARED_KEY, AuthVerdict, Authorizer, AuthorizerProvider, CryptoError,
    SessionSecret,
};

/// Client nonce size.
pub const AUTH_NONCE_SIZE: usize = 16;

/// MAC tag size.
pub const AUTH_TAG_SIZE: usize = 32;

/// Derived session secret size.
pub const SESSION_SECRET_SIZE: usize = 32;

const AUTHORIZE_LABEL: &[u8] = b"tether authorize";
const REPLY_LABEL: &[u8] = b"tether reply";
const SESSION_INFO: &[u8] = b"tether session secret";

fn tag(key: &SessionSecret, label: &[u8], nonce: &[u8]) -> [u8; AUTH_TAG_SIZE] {
    let mut mac = keyed_mac(key.as_bytes());
    mac.update(label);
    mac.update(nonce);
    mac.finalize().into_bytes().into()
}

fn check_tag(key: &SessionSecret, label: &[u8], nonce: &[u8], claimed: &[u8]) -> bool {
    let mut mac = keyed_mac(key.as_bytes());
    mac.update(label);
    mac.update(nonce);
    mac.verify_slice(claimed).is_ok()
}

fn derive_secret(key: &SessionSecret, nonce: &[u8]) -> Result<SessionSecret, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(nonce), key.as_bytes());
    let mut okm = [0u8; SESSION_SECRET_SIZE];
    hk.expand(SESSION_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    let secret = SessionSecret::from_bytes(okm.to_vec());
    okm.zeroize();
    Ok(secret)
}

fn split_blob(blob: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    if blob.len() != AUTH_NONCE_SIZE + AUTH_TAG_SIZE {
        return Err(CryptoError::MalformedAuthorizer("wrong length"));
    }
    Ok(blob.split_at(AUTH_NONCE_SIZE))
}

/// [`AuthorizerProvider`] for a single pre-shared key.
#[derive(Debug, Clone)]
pub struct SharedKeyAuthorizer {
    key: SessionSecret,
}

impl SharedKeyAuthorizer {
    /// Create a provider for `key`.
    ///
    /// # Errors
    /// Returns `InvalidKeyLength` for an empty key.
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let key = SessionSecret::from_bytes(key);
        if key.is_empty() {
            return Err(CryptoError::InvalidKeyLength(0));
        }
        Ok(Self { key })
    }

    fn check(&self, protocol: u32, blob: &[u8]) -> Result<AuthVerdict, CryptoError> {
        if protocol != AUTH_PROTOCOL_SHARED_KEY {
            return Err(CryptoError::MalformedAuthorizer("unexpected protocol"));
        }
        let (nonce, claimed) = split_blob(blob)?;
        if !check_tag(&self.key, AUTHORIZE_LABEL, nonce, claimed) {
            return Ok(AuthVerdict::reject());
        }
        Ok(AuthVerdict {
            valid: true,
            reply: tag(&self.key, REPLY_LABEL, nonce).to_vec(),
            session_secret: Some(derive_secret(&self.key, nonce)?),
        })
    }
}

impl AuthorizerProvider for SharedKeyAuthorizer {
    fn produce(&self, peer_type: u32, retry: bool) -> Option<Authorizer> {
        let mut nonce = [0u8; AUTH_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let session_secret = match derive_secret(&self.key, &nonce) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(error = %e, peer_type, "cannot derive session secret");
                return None;
            }
        };
        if retry {
            tracing::debug!(peer_type, "refreshing authorizer after rejection");
        }

        let mut blob = Vec::with_capacity(AUTH_NONCE_SIZE + AUTH_TAG_SIZE);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&tag(&self.key, AUTHORIZE_LABEL, &nonce));
        Some(Authorizer {
            protocol: AUTH_PROTOCOL_SHARED_KEY,
            blob,
            session_secret,
            challenge: nonce.to_vec(),
        })
    }

    fn verify(&self, peer_type: u32, protocol: u32, blob: &[u8]) -> AuthVerdict {
        match self.check(protocol, blob) {
            Ok(verdict) => {
                if !verdict.valid {
                    tracing::info!(peer_type, "authorizer tag mismatch");
                }
                verdict
            }
            Err(e) => {
                tracing::info!(error = %e, peer_type, protocol, "rejecting authorizer");
                AuthVerdict::reject()
            }
        }
    }

    fn verify_reply(&self, authorizer: &Authorizer, reply: &[u8]) -> bool {
        check_tag(&self.key, REPLY_LABEL, &authorizer.challenge, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::entity_type;

    #[test]
    fn test_shared_key_exchange() {
        let client = SharedKeyAuthorizer::new(b"correct horse".to_vec()).unwrap();
        let server = SharedKeyAuthorizer::new(b"correct horse".to_vec()).unwrap();

        let auth = client.produce(entity_type::OSD, false).unwrap();
        assert_eq!(auth.protocol, AUTH_PROTOCOL_SHARED_KEY);
        assert_eq!(auth.blob.len(), AUTH_NONCE_SIZE + AUTH_TAG_SIZE);

        let verdict = server.verify(entity_type::CLIENT, auth.protocol, &auth.blob);
        assert!(verdict.valid);
        assert_eq!(verdict.session_secret.as_ref(), Some(&auth.session_secret));
        assert!(client.verify_reply(&auth, &verdict.reply));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let client = SharedKeyAuthorizer::new(b"one".to_vec()).unwrap();
        let server = SharedKeyAuthorizer::new(b"two".to_vec()).unwrap();
        let auth = client.produce(entity_type::OSD, false).unwrap();
        let verdict = server.verify(entity_type::CLIENT, auth.protocol, &auth.blob);
        assert!(!verdict.valid);
        assert!(verdict.session_secret.is_none());
    }

    #[test]
    fn test_forged_reply_rejected() {
        let client = SharedKeyAuthorizer::new(b"key".to_vec()).unwrap();
        let auth = client.produce(entity_type::MON, false).unwrap();
        assert!(!client.verify_reply(&auth, &[0u8; AUTH_TAG_SIZE]));
        assert!(!client.verify_reply(&auth, &[]));
    }

    #[test]
    fn test_malformed_blob_rejected() {
        let server = SharedKeyAuthorizer::new(b"key".to_vec()).unwrap();
        assert!(!server.verify(entity_type::CLIENT, AUTH_PROTOCOL_SHARED_KEY, &[1, 2, 3]).valid);
        let auth = server.produce(entity_type::MON, false).unwrap();
        assert!(!server.verify(entity_type::CLIENT, 99, &auth.blob).valid);
    }

    #[test]
    fn test_retry_uses_fresh_nonce() {
        let client = SharedKeyAuthorizer::new(b"key".to_vec()).unwrap();
        let first = client.produce(entity_type::OSD, false).unwrap();
        let second = client.produce(entity_type::OSD, true).unwrap();
        assert_ne!(first.challenge, second.challenge);
        assert_ne!(first.session_secret, second.session_secret);
    }

    #[test]
    fn test_empty_key_refused() {
        assert_eq!(
            SharedKeyAuthorizer::new(Vec::new()).unwrap_err(),
            CryptoError::InvalidKeyLength(0)
        );
    }
}
