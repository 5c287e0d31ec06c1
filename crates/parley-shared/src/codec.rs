//! Canonical encoding and Ed25519 signing for messages and envelopes.
//!
//! The canonical form of an entity is compact JSON of its signable fields in
//! a fixed declaration order, with the signature left out. Envelope payloads
//! are generic JSON objects; `serde_json` keeps object keys sorted, so two
//! payloads with equal content always encode to the same bytes whatever key
//! order they arrived in.
//!
//! Verification never errors: a missing, malformed or mismatching signature
//! is just `false`.

use ed25519_dalek::{Signer, SigningKey};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::constants::SECRET_KEY_SIZE;
use crate::error::CodecError;
use crate::identity::{verify_signature, Identity};
use crate::message::{timestamp_micros, Message, MessageType};
use crate::protocol::ProtocolEnvelope;
use crate::types::RoomId;

/// An entity carrying a detached signature over its canonical bytes.
pub trait Signable {
    fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError>;
    fn signature(&self) -> &str;
    fn set_signature(&mut self, signature: String);
}

#[derive(Serialize)]
struct CanonicalMessage<'a> {
    id: &'a Uuid,
    room_id: &'a RoomId,
    user_id: &'a str,
    username: &'a str,
    content: &'a str,
    #[serde(rename = "type")]
    kind: MessageType,
    encrypted: bool,
    timestamp: String,
}

impl Signable for Message {
    fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let canonical = CanonicalMessage {
            id: &self.id,
            room_id: &self.room_id,
            user_id: &self.user_id,
            username: &self.username,
            content: &self.content,
            kind: self.kind,
            encrypted: self.encrypted,
            timestamp: timestamp_micros::format(&self.timestamp),
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn set_signature(&mut self, signature: String) {
        self.signature = signature;
    }
}

#[derive(Serialize)]
struct CanonicalEnvelope<'a> {
    version: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    message_id: &'a str,
    from: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_id: Option<&'a str>,
    payload: &'a Value,
    timestamp: i64,
}

impl Signable for ProtocolEnvelope {
    fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let canonical = CanonicalEnvelope {
            version: &self.version,
            kind: self.kind.as_str(),
            message_id: &self.message_id,
            from: &self.from,
            to: self.to.as_deref(),
            room_id: self.room_id.as_deref(),
            payload: &self.payload,
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn set_signature(&mut self, signature: String) {
        self.signature = signature;
    }
}

pub fn canonical_bytes<T: Signable>(entity: &T) -> Result<Vec<u8>, CodecError> {
    entity.canonical_bytes()
}

/// Sign `entity` in place with a raw 32-byte Ed25519 secret key.
pub fn sign<T: Signable>(entity: &mut T, private_key: &[u8]) -> Result<(), CodecError> {
    if private_key.is_empty() {
        return Err(CodecError::InvalidKey("no private key available".into()));
    }
    let secret: [u8; SECRET_KEY_SIZE] = private_key.try_into().map_err(|_| {
        CodecError::InvalidKey(format!(
            "expected {SECRET_KEY_SIZE} key bytes, got {}",
            private_key.len()
        ))
    })?;
    let signing_key = SigningKey::from_bytes(&secret);
    let bytes = entity.canonical_bytes()?;
    entity.set_signature(hex::encode(signing_key.sign(&bytes).to_bytes()));
    Ok(())
}

pub fn sign_with<T: Signable>(entity: &mut T, identity: &Identity) -> Result<(), CodecError> {
    sign(entity, identity.secret_bytes())
}

/// Check `entity`'s signature against a raw public key.
pub fn verify<T: Signable>(entity: &T, public_key: &[u8]) -> bool {
    if entity.signature().is_empty() {
        return false;
    }
    let Ok(signature) = hex::decode(entity.signature()) else {
        return false;
    };
    let Ok(bytes) = entity.canonical_bytes() else {
        return false;
    };
    verify_signature(public_key, &bytes, &signature)
}

/// [`verify`] with a hex public key, the form user ids travel in.
pub fn verify_hex<T: Signable>(entity: &T, public_key_hex: &str) -> bool {
    match hex::decode(public_key_hex) {
        Ok(public_key) => verify(entity, &public_key),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EnvelopeType, HeartbeatPayload, Payload};

    fn signed_message(identity: &Identity) -> Message {
        let mut message = Message::new(
            RoomId::new(),
            identity.public_key_hex(),
            identity.nickname(),
            "hello",
        );
        sign_with(&mut message, identity).unwrap();
        message
    }

    #[test]
    fn signed_message_verifies() {
        let alice = Identity::generate("alice");
        let message = signed_message(&alice);
        assert_eq!(message.signature.len(), 128);
        assert!(verify(&message, &alice.public_key_bytes()));
        assert!(verify_hex(&message, &alice.public_key_hex()));
    }

    #[test]
    fn tampering_with_any_field_breaks_the_signature() {
        let alice = Identity::generate("alice");
        let original = signed_message(&alice);
        let key = alice.public_key_bytes();

        let tampered: Vec<Box<dyn Fn(&mut Message)>> = vec![
            Box::new(|m| m.id = Uuid::new_v4()),
            Box::new(|m| m.room_id = RoomId::new()),
            Box::new(|m| m.user_id.push('0')),
            Box::new(|m| m.username = "mallory".into()),
            Box::new(|m| m.content = "goodbye".into()),
            Box::new(|m| m.kind = MessageType::System),
            Box::new(|m| m.encrypted = true),
            Box::new(|m| m.timestamp += chrono::Duration::microseconds(1)),
        ];
        for mutate in tampered {
            let mut message = original.clone();
            mutate(&mut message);
            assert!(!verify(&message, &key));
        }
    }

    #[test]
    fn signature_survives_json_roundtrip() {
        let alice = Identity::generate("alice");
        let message = signed_message(&alice);
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(verify(&back, &alice.public_key_bytes()));
    }

    #[test]
    fn verification_failures_are_false_not_errors() {
        let alice = Identity::generate("alice");
        let bob = Identity::generate("bob");
        let mut message = signed_message(&alice);

        assert!(!verify(&message, &bob.public_key_bytes()));
        assert!(!verify(&message, &[]));
        assert!(!verify_hex(&message, "zz"));

        message.signature = "not hex".into();
        assert!(!verify(&message, &alice.public_key_bytes()));

        message.signature.clear();
        assert!(!verify(&message, &alice.public_key_bytes()));
    }

    #[test]
    fn signing_without_a_key_fails() {
        let mut message = Message::new(RoomId::new(), "u", "alice", "hi");
        assert!(matches!(sign(&mut message, &[]), Err(CodecError::InvalidKey(_))));
        assert!(matches!(sign(&mut message, &[1u8; 5]), Err(CodecError::InvalidKey(_))));
        assert!(message.signature.is_empty());
    }

    #[test]
    fn envelope_signature_ignores_payload_key_order() {
        let node = Identity::generate("node");
        let mut envelope = ProtocolEnvelope::new(EnvelopeType::Heartbeat, node.public_key_hex())
            .with_payload(Payload::Heartbeat(HeartbeatPayload {
                nickname: "node".into(),
                public_key: node.public_key_hex(),
                i2p_address: String::new(),
                active_rooms: vec!["r1".into()],
            }))
            .unwrap();
        sign_with(&mut envelope, &node).unwrap();

        // Same envelope with payload keys written in a different order.
        let reordered = format!(
            r#"{{"signature":"{}","timestamp":{},"payload":{{"active_rooms":["r1"],"public_key":"{}","nickname":"node","i2p_address":""}},"from":"{}","message_id":"{}","type":"heartbeat","version":"1.0"}}"#,
            envelope.signature,
            envelope.timestamp,
            node.public_key_hex(),
            node.public_key_hex(),
            envelope.message_id,
        );
        let parsed = ProtocolEnvelope::parse(reordered.as_bytes()).unwrap();
        assert!(verify(&parsed, &node.public_key_bytes()));

        let mut forged = parsed.clone();
        forged.room_id = Some("elsewhere".into());
        assert!(!verify(&forged, &node.public_key_bytes()));
    }
}
