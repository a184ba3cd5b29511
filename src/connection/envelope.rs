//! Per-message encryption envelope: X25519 agreement, HKDF-SHA256 key
//! derivation, ChaCha20-Poly1305 AEAD.
//!
//! The derived key depends only on the local private scalar and the peer's
//! public key bytes — never on any mutable session state — so an
//! out-of-order delivery still decrypts, and a cached key is naturally
//! invalidated if a peer reconnects under a different key.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as AeadNonce};
use dashmap::DashMap;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::identity::KeyPair;

const HKDF_INFO: &[u8] = b"resonet-envelope-v1";
const NONCE_LEN: usize = 12;

/// Caches the derived AEAD key per peer public key so repeated sends don't
/// re-run Diffie-Hellman + HKDF on every message.
pub struct EnvelopeKeys {
    local: KeyPair,
    cache: DashMap<[u8; 32], [u8; 32]>,
}

impl EnvelopeKeys {
    pub fn new(local: KeyPair) -> Self {
        Self {
            local,
            cache: DashMap::new(),
        }
    }

    pub fn local_public_key(&self) -> [u8; 32] {
        self.local.public_key_bytes()
    }

    fn aead_key_for(&self, peer_public_key: &[u8; 32]) -> [u8; 32] {
        if let Some(cached) = self.cache.get(peer_public_key) {
            return *cached;
        }
        let shared = self.local.diffie_hellman(peer_public_key);
        let hk = Hkdf::<Sha256>::new(None, &shared);
        let mut okm = [0u8; 32];
        hk.expand(HKDF_INFO, &mut okm)
            .expect("32 is a valid HKDF-SHA256 output length");
        self.cache.insert(*peer_public_key, okm);
        okm
    }

    /// Encrypt `plaintext` for `peer_public_key`, returning
    /// `base64(nonce || ciphertext || tag)`.
    pub fn encrypt(&self, peer_public_key: &[u8; 32], plaintext: &str) -> Result<String> {
        let key = self.aead_key_for(peer_public_key);
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| Error::DecryptionFailed(format!("bad key length: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = AeadNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::DecryptionFailed(format!("encrypt failed: {e}")))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(envelope))
    }

    /// Reverse [`Self::encrypt`], rejecting envelopes whose auth tag fails.
    pub fn decrypt(&self, peer_public_key: &[u8; 32], envelope_b64: &str) -> Result<String> {
        let envelope = base64::engine::general_purpose::STANDARD
            .decode(envelope_b64)
            .map_err(|e| Error::DecryptionFailed(format!("bad base64: {e}")))?;

        if envelope.len() < NONCE_LEN {
            return Err(Error::DecryptionFailed("envelope too short".into()));
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);

        let key = self.aead_key_for(peer_public_key);
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| Error::DecryptionFailed(format!("bad key length: {e}")))?;
        let nonce = AeadNonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::DecryptionFailed("authentication tag mismatch".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::DecryptionFailed(format!("non-utf8 plaintext: {e}")))
    }
}
