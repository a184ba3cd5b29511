//! Message record layout, construction, and validation (C2).

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::identity::{derive_resonance_key, generate_whisper_tag, NodeId};

/// Current protocol version carried in every record. A mismatch on receipt
/// is a validation warning, never an error.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default time-to-live for a record that does not specify one explicitly.
pub const DEFAULT_TTL_MS: u64 = 300_000;

/// The message kind tagged union. Unknown kinds encountered on the wire are
/// a validation error, not silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Whisper,
    Broadcast,
    Resonance,
    Ping,
    Pong,
    Hello,
    Goodbye,
    Error,
    FileSync,
    MiningSignal,
    Dreamspace,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// A 128-bit random value used for replay and dedup keying, textually
/// represented as 32 hex digits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(#[serde(with = "hex_bytes16")] [u8; 16]);

impl Nonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

mod hex_bytes16 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

/// Kind-specific fields, carried alongside the shared [`Message`] header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    Whisper {
        target_id: NodeId,
    },
    Broadcast {
        max_hops: u32,
        current_hops: u32,
        seen_by: Vec<NodeId>,
    },
    Resonance {
        intent: String,
        strength: f32,
    },
    Ping,
    Pong,
    Hello,
    Goodbye,
    Error {
        message: String,
    },
    /// Extension-defined structured fields, carried through unchanged.
    FileSync {
        fields: serde_json::Value,
    },
    MiningSignal {
        fields: serde_json::Value,
    },
    Dreamspace {
        fields: serde_json::Value,
    },
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::Whisper { .. } => MessageKind::Whisper,
            Body::Broadcast { .. } => MessageKind::Broadcast,
            Body::Resonance { .. } => MessageKind::Resonance,
            Body::Ping => MessageKind::Ping,
            Body::Pong => MessageKind::Pong,
            Body::Hello => MessageKind::Hello,
            Body::Goodbye => MessageKind::Goodbye,
            Body::Error { .. } => MessageKind::Error,
            Body::FileSync { .. } => MessageKind::FileSync,
            Body::MiningSignal { .. } => MessageKind::MiningSignal,
            Body::Dreamspace { .. } => MessageKind::Dreamspace,
        }
    }
}

/// The on-wire message record: a shared header plus a kind-specific [`Body`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender: NodeId,
    #[serde(with = "hex_bytes32")]
    pub resonance_key: [u8; 32],
    pub whisper_tag: String,
    /// Application payload. Plaintext at construction; the connection
    /// manager encrypts it in place before the record goes over the wire
    /// and decrypts it in place on receipt, so every other header field
    /// stays cleartext JSON throughout. Empty for kinds that carry no
    /// application payload (Ping/Pong/Hello/Goodbye).
    pub payload: String,
    pub timestamp: u64,
    pub version: String,
    pub ttl: u64,
    pub nonce: Nonce,
    #[serde(flatten)]
    pub body: Body,
}

mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Construction options accepted by [`construct`]. Anything left unset falls
/// back to the defaults documented per field.
#[derive(Debug, Default, Clone)]
pub struct ConstructOptions {
    pub ttl_ms: Option<u64>,
    pub intent: Option<String>,
    pub whisper_tag: Option<String>,
}

/// Build a message of `kind` from `sender`, an opaque already-encrypted
/// `payload`, and kind-specific `body`. Populates the common header fields:
/// timestamp, protocol version, ttl, a fresh random nonce, and the
/// resonance key / whisper tag derived from `options.intent`.
pub fn construct(
    sender: NodeId,
    payload: String,
    body: Body,
    options: ConstructOptions,
) -> crate::error::Result<Message> {
    let intent = options.intent.unwrap_or_else(|| "default".to_string());
    let whisper_tag = match options.whisper_tag {
        Some(tag) => tag,
        None => generate_whisper_tag(&intent, None)?,
    };

    Ok(Message {
        sender,
        resonance_key: derive_resonance_key(&intent),
        whisper_tag,
        payload,
        timestamp: now_ms(),
        version: PROTOCOL_VERSION.to_string(),
        ttl: options.ttl_ms.unwrap_or(DEFAULT_TTL_MS),
        nonce: Nonce::generate(),
        body,
    })
}

/// The result of validating a [`Message`]: whether it's structurally and
/// semantically valid, hard errors, and non-fatal warnings (e.g. version
/// mismatch).
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Purely structural/semantic validation. Never decrypts the payload.
pub fn validate(m: &Message) -> Validation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if m.version != PROTOCOL_VERSION {
        warnings.push(format!(
            "version mismatch: message={} local={}",
            m.version, PROTOCOL_VERSION
        ));
    }

    if is_expired(m) {
        errors.push("expired".to_string());
    }

    match &m.body {
        Body::Whisper { .. } => {}
        Body::Broadcast {
            max_hops,
            current_hops,
            seen_by,
        } => {
            if current_hops > max_hops {
                errors.push("current_hops exceeds max_hops".to_string());
            }
            if !seen_by.contains(&m.sender) {
                errors.push("sender missing from seen_by".to_string());
            }
        }
        Body::Resonance { strength, .. } => {
            if !(0.0..=1.0).contains(strength) {
                errors.push("strength out of range [0,1]".to_string());
            }
        }
        _ => {}
    }

    Validation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Serialize to the UTF-8 JSON wire format.
pub fn serialize(m: &Message) -> crate::error::Result<String> {
    Ok(serde_json::to_string(m)?)
}

/// Deserialize from the UTF-8 JSON wire format.
pub fn deserialize(s: &str) -> crate::error::Result<Message> {
    Ok(serde_json::from_str(s)?)
}

/// True iff `m` is a Resonance record matching `intent` at or above
/// `min_strength`.
pub fn matches_resonance(m: &Message, intent: &str, min_strength: f32) -> bool {
    match &m.body {
        Body::Resonance {
            intent: msg_intent,
            strength,
        } => msg_intent == intent && *strength >= min_strength,
        _ => false,
    }
}

/// `now - m.timestamp > m.ttl`.
pub fn is_expired(m: &Message) -> bool {
    now_ms().saturating_sub(m.timestamp) > m.ttl
}

/// Construct a fresh Broadcast body with `seen_by` initialized to `{sender}`
/// and `current_hops = 0`, per §3 of the data model.
pub fn new_broadcast_body(sender: &NodeId, max_hops: u32) -> Body {
    let mut seen_by = HashSet::new();
    seen_by.insert(sender.clone());
    Body::Broadcast {
        max_hops,
        current_hops: 0,
        seen_by: seen_by.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_node_id;

    fn sender() -> NodeId {
        generate_node_id().unwrap()
    }

    #[test]
    fn construct_then_validate_round_trips() {
        let s = sender();
        let target = sender();
        let m = construct(
            s.clone(),
            "cGF5bG9hZA==".to_string(),
            Body::Whisper {
                target_id: target,
            },
            ConstructOptions::default(),
        )
        .unwrap();
        let wire = serialize(&m).unwrap();
        let back = deserialize(&wire).unwrap();
        let v = validate(&back);
        assert!(v.valid, "errors: {:?}", v.errors);
    }

    #[test]
    fn expired_message_fails_validation() {
        let s = sender();
        let mut m = construct(
            s,
            String::new(),
            Body::Ping,
            ConstructOptions {
                ttl_ms: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        m.timestamp -= 10_000;
        let v = validate(&m);
        assert!(!v.valid);
        assert!(v.errors.iter().any(|e| e.contains("expired")));
    }

    #[test]
    fn resonance_matching_respects_strength_threshold() {
        let s = sender();
        let m = construct(
            s,
            String::new(),
            Body::Resonance {
                intent: "mining:coord".to_string(),
                strength: 0.4,
            },
            ConstructOptions {
                intent: Some("mining:coord".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!matches_resonance(&m, "mining:coord", 0.5));

        let m2 = construct(
            m.sender.clone(),
            String::new(),
            Body::Resonance {
                intent: "mining:coord".to_string(),
                strength: 0.9,
            },
            ConstructOptions {
                intent: Some("mining:coord".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches_resonance(&m2, "mining:coord", 0.5));
    }

    #[test]
    fn broadcast_requires_sender_in_seen_by() {
        let s = sender();
        let body = new_broadcast_body(&s, 10);
        let m = construct(s, String::new(), body, ConstructOptions::default()).unwrap();
        assert!(validate(&m).valid);
    }
}
