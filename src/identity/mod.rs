//! Ephemeral identity and key agreement primitives (C1).
//!
//! Every node generates a fresh [`NodeId`] and [`KeyPair`] per session; nothing
//! here is persisted to disk. The functions in this module are pure and hold
//! no shared state.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Ephemeral node identifier of the form `entropy:timestamp`.
///
/// `entropy` is 16 random bytes rendered as 32 lowercase hex digits;
/// `timestamp` is the creation time in Unix milliseconds rendered as
/// lowercase hex without fixed width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an already-validated string. Prefer [`generate_node_id`] or
    /// [`validate_node_id`] over calling this directly.
    fn from_raw(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if validate_node_id(s) {
            Ok(NodeId::from_raw(s.to_string()))
        } else {
            Err(Error::InvalidId(s.to_string()))
        }
    }
}

/// Draw 16 bytes from the OS CSPRNG, sample the wall clock, and return the
/// resulting `entropy:timestamp` node id. Fails only if the OS RNG fails.
pub fn generate_node_id() -> Result<NodeId> {
    let mut entropy = [0u8; 16];
    rand::rngs::OsRng
        .try_fill_bytes(&mut entropy)
        .map_err(|e| Error::Fatal(format!("OS RNG failure: {e}")))?;

    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Fatal(format!("system clock before epoch: {e}")))?
        .as_millis();

    Ok(NodeId::from_raw(format!(
        "{}:{:x}",
        hex::encode(entropy),
        timestamp_ms
    )))
}

/// `^[0-9a-f]{32}:[0-9a-f]+$`
pub fn validate_node_id(s: &str) -> bool {
    fn is_lower_hex(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    let Some((entropy, timestamp)) = s.split_once(':') else {
        return false;
    };
    entropy.len() == 32 && is_lower_hex(entropy) && is_lower_hex(timestamp)
}

/// Parse the hex timestamp suffix of a node id. Only defined on ids for which
/// [`validate_node_id`] returns true.
pub fn extract_timestamp(s: &str) -> Result<u128> {
    if !validate_node_id(s) {
        return Err(Error::InvalidId(s.to_string()));
    }
    let (_, timestamp) = s.split_once(':').expect("validated above");
    u128::from_str_radix(timestamp, 16).map_err(|e| Error::InvalidId(format!("{s}: {e}")))
}

/// X25519 key pair used for per-message Diffie-Hellman agreement.
///
/// The private scalar is wrapped in `StaticSecret` (zeroized on drop); the
/// public key is freely shareable raw bytes.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Draw a fresh key pair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Derive the shared secret for a peer's raw public key bytes. Depends
    /// only on this key pair's private scalar and the peer's public key —
    /// no mutable session state — so the result is stable across calls.
    pub fn diffie_hellman(&self, peer_public_key: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public_key);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

/// 32-byte SHA-256 digest of an intent string, used as a routing tag.
/// Deterministic: equal intents always produce equal keys.
pub fn derive_resonance_key(intent: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(intent.as_bytes());
    hasher.finalize().into()
}

/// First 8 bytes of SHA-256 over the topic (and, if present, a canonical JSON
/// encoding of `metadata`), rendered as 16 lowercase hex digits.
pub fn generate_whisper_tag(topic: &str, metadata: Option<&serde_json::Value>) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    if let Some(meta) = metadata {
        let canonical = serde_json::to_vec(meta)?;
        hasher.update(&canonical);
    }
    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..8]))
}

/// Overwrite a secret byte buffer in place. Used where a raw DH output needs
/// explicit clearing outside of a type that already implements `Zeroize`.
pub fn wipe(bytes: &mut [u8]) {
    bytes.zeroize();
}
