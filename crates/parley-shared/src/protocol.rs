//! Versioned, signed envelope for control-plane traffic between participants.
//!
//! The envelope carries its payload as generic JSON so that unknown envelope
//! types can be relayed untouched. [`ProtocolEnvelope::resolve_payload`] is
//! the single place where the generic payload becomes a typed [`Payload`].

use std::fmt;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::PROTOCOL_VERSION;
use crate::error::ProtocolError;
use crate::message::Message;

/// Envelope type tag. Unknown tags are kept verbatim in [`EnvelopeType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeType {
    Heartbeat,
    Join,
    Leave,
    Chat,
    Sync,
    Ping,
    Pong,
    Invite,
    Dm,
    RoomInfo,
    UserInfo,
    Block,
    Unblock,
    Other(String),
}

impl EnvelopeType {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeType::Heartbeat => "heartbeat",
            EnvelopeType::Join => "join",
            EnvelopeType::Leave => "leave",
            EnvelopeType::Chat => "chat",
            EnvelopeType::Sync => "sync",
            EnvelopeType::Ping => "ping",
            EnvelopeType::Pong => "pong",
            EnvelopeType::Invite => "invite",
            EnvelopeType::Dm => "dm",
            EnvelopeType::RoomInfo => "room_info",
            EnvelopeType::UserInfo => "user_info",
            EnvelopeType::Block => "block",
            EnvelopeType::Unblock => "unblock",
            EnvelopeType::Other(other) => other,
        }
    }
}

impl From<String> for EnvelopeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "heartbeat" => EnvelopeType::Heartbeat,
            "join" => EnvelopeType::Join,
            "leave" => EnvelopeType::Leave,
            "chat" => EnvelopeType::Chat,
            "sync" => EnvelopeType::Sync,
            "ping" => EnvelopeType::Ping,
            "pong" => EnvelopeType::Pong,
            "invite" => EnvelopeType::Invite,
            "dm" => EnvelopeType::Dm,
            "room_info" => EnvelopeType::RoomInfo,
            "user_info" => EnvelopeType::UserInfo,
            "block" => EnvelopeType::Block,
            "unblock" => EnvelopeType::Unblock,
            _ => EnvelopeType::Other(value),
        }
    }
}

impl From<EnvelopeType> for String {
    fn from(value: EnvelopeType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub nickname: String,
    pub public_key: String,
    #[serde(default)]
    pub i2p_address: String,
    #[serde(default)]
    pub active_rooms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub invite_code: String,
    pub nickname: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    #[serde(default)]
    pub is_command: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub room_id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmPayload {
    pub content: String,
    #[serde(default)]
    pub is_encrypted: bool,
}

/// Shared by `block`, `unblock` and `user_info` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoPayload {
    pub nickname: String,
    pub is_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfoPayload {
    pub room_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub moderators: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub room_id: String,
    /// Unix seconds of the newest message the requester already has.
    #[serde(default)]
    pub last_sync_time: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Typed view of an envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Heartbeat(HeartbeatPayload),
    Join(JoinPayload),
    Leave(LeavePayload),
    Chat(ChatPayload),
    Sync(SyncPayload),
    Invite(InvitePayload),
    Dm(DmPayload),
    RoomInfo(RoomInfoPayload),
    UserInfo(UserInfoPayload),
    Block(UserInfoPayload),
    Unblock(UserInfoPayload),
    /// Payload of an envelope type this build does not know.
    Opaque(Value),
    /// No payload (`ping`, `pong`, or an omitted payload).
    Empty,
}

impl Payload {
    /// Envelope type this payload belongs to; `None` for payloads that fit
    /// any envelope.
    pub fn kind(&self) -> Option<EnvelopeType> {
        match self {
            Payload::Heartbeat(_) => Some(EnvelopeType::Heartbeat),
            Payload::Join(_) => Some(EnvelopeType::Join),
            Payload::Leave(_) => Some(EnvelopeType::Leave),
            Payload::Chat(_) => Some(EnvelopeType::Chat),
            Payload::Sync(_) => Some(EnvelopeType::Sync),
            Payload::Invite(_) => Some(EnvelopeType::Invite),
            Payload::Dm(_) => Some(EnvelopeType::Dm),
            Payload::RoomInfo(_) => Some(EnvelopeType::RoomInfo),
            Payload::UserInfo(_) => Some(EnvelopeType::UserInfo),
            Payload::Block(_) => Some(EnvelopeType::Block),
            Payload::Unblock(_) => Some(EnvelopeType::Unblock),
            Payload::Opaque(_) | Payload::Empty => None,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Heartbeat(p) => serde_json::to_value(p),
            Payload::Join(p) => serde_json::to_value(p),
            Payload::Leave(p) => serde_json::to_value(p),
            Payload::Chat(p) => serde_json::to_value(p),
            Payload::Sync(p) => serde_json::to_value(p),
            Payload::Invite(p) => serde_json::to_value(p),
            Payload::Dm(p) => serde_json::to_value(p),
            Payload::RoomInfo(p) => serde_json::to_value(p),
            Payload::UserInfo(p) | Payload::Block(p) | Payload::Unblock(p) => {
                serde_json::to_value(p)
            }
            Payload::Opaque(value) => Ok(value.clone()),
            Payload::Empty => Ok(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEnvelope {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl ProtocolEnvelope {
    /// Start an unsigned envelope stamped with the current version and time.
    pub fn build(kind: EnvelopeType, from: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            kind,
            message_id: message_id.into(),
            from: from.into(),
            to: None,
            room_id: None,
            payload: Value::Null,
            timestamp: Utc::now().timestamp(),
            signature: String::new(),
        }
    }

    /// [`build`](Self::build) with a fresh random message id.
    pub fn new(kind: EnvelopeType, from: impl Into<String>) -> Self {
        Self::build(kind, from, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_recipient(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Store a typed payload. The payload must belong to this envelope's type.
    pub fn attach_payload(&mut self, payload: Payload) -> Result<(), ProtocolError> {
        if let Some(found) = payload.kind() {
            if found != self.kind {
                return Err(ProtocolError::PayloadMismatch {
                    expected: self.kind.to_string(),
                    found: found.to_string(),
                });
            }
        }
        self.payload = payload.to_value().map_err(ProtocolError::Payload)?;
        Ok(())
    }

    /// Builder form of [`attach_payload`](Self::attach_payload).
    pub fn with_payload(mut self, payload: Payload) -> Result<Self, ProtocolError> {
        self.attach_payload(payload)?;
        Ok(self)
    }

    /// Check the fields every envelope must carry regardless of type.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version.clone()));
        }
        if self.kind.as_str().is_empty() {
            return Err(ProtocolError::MissingField("type"));
        }
        if self.from.is_empty() {
            return Err(ProtocolError::MissingField("from"));
        }
        if self.message_id.is_empty() {
            return Err(ProtocolError::MissingField("message_id"));
        }
        if self.timestamp == 0 {
            return Err(ProtocolError::MissingField("timestamp"));
        }
        Ok(())
    }

    /// Decode and validate. Undecodable bytes are [`ProtocolError::Decode`];
    /// decodable but invalid envelopes get the semantic variants.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(ProtocolError::Decode)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Convert the generic payload into the variant implied by the type.
    pub fn resolve_payload(&self) -> Result<Payload, ProtocolError> {
        if self.payload.is_null() {
            return Ok(Payload::Empty);
        }
        let payload = match &self.kind {
            EnvelopeType::Heartbeat => Payload::Heartbeat(self.decode_payload()?),
            EnvelopeType::Join => Payload::Join(self.decode_payload()?),
            EnvelopeType::Leave => Payload::Leave(self.decode_payload()?),
            EnvelopeType::Chat => Payload::Chat(self.decode_payload()?),
            EnvelopeType::Sync => Payload::Sync(self.decode_payload()?),
            EnvelopeType::Invite => Payload::Invite(self.decode_payload()?),
            EnvelopeType::Dm => Payload::Dm(self.decode_payload()?),
            EnvelopeType::RoomInfo => Payload::RoomInfo(self.decode_payload()?),
            EnvelopeType::UserInfo => Payload::UserInfo(self.decode_payload()?),
            EnvelopeType::Block => Payload::Block(self.decode_payload()?),
            EnvelopeType::Unblock => Payload::Unblock(self.decode_payload()?),
            EnvelopeType::Ping | EnvelopeType::Pong | EnvelopeType::Other(_) => {
                Payload::Opaque(self.payload.clone())
            }
        };
        Ok(payload)
    }

    fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(ProtocolError::Payload)
    }

    /// Compact JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_envelope() -> ProtocolEnvelope {
        ProtocolEnvelope::build(EnvelopeType::Join, "alice-key", "m-1")
            .with_payload(Payload::Join(JoinPayload {
                room_id: None,
                invite_code: "AB12CD34".into(),
                nickname: "alice".into(),
                public_key: "alice-key".into(),
            }))
            .unwrap()
    }

    #[test]
    fn build_stamps_version_and_time() {
        let env = ProtocolEnvelope::build(EnvelopeType::Ping, "a", "m");
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert!(env.timestamp > 0);
        assert!(env.validate().is_ok());
    }

    #[test]
    fn roundtrip_through_bytes() {
        let mut env = join_envelope().with_room("r-1");
        env.signature = "ab".repeat(64);

        let parsed = ProtocolEnvelope::parse(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(parsed.resolve_payload().unwrap(), join_envelope().resolve_payload().unwrap());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let mut env = ProtocolEnvelope::build(EnvelopeType::Leave, "a", "m");
        let err = env
            .attach_payload(Payload::Dm(DmPayload {
                content: "hi".into(),
                is_encrypted: false,
            }))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadMismatch { .. }));
    }

    #[test]
    fn validate_requires_mandatory_fields() {
        let mut env = join_envelope();
        env.version = "2.0".into();
        assert!(matches!(env.validate(), Err(ProtocolError::UnsupportedVersion(_))));

        let mut env = join_envelope();
        env.from.clear();
        assert!(matches!(env.validate(), Err(ProtocolError::MissingField("from"))));

        let mut env = join_envelope();
        env.message_id.clear();
        assert!(matches!(env.validate(), Err(ProtocolError::MissingField("message_id"))));

        let mut env = join_envelope();
        env.timestamp = 0;
        assert!(matches!(env.validate(), Err(ProtocolError::MissingField("timestamp"))));

        let mut env = join_envelope();
        env.kind = EnvelopeType::Other(String::new());
        assert!(matches!(env.validate(), Err(ProtocolError::MissingField("type"))));
    }

    #[test]
    fn decode_errors_are_distinct_from_semantic_errors() {
        assert!(matches!(
            ProtocolEnvelope::parse(b"{not json"),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            ProtocolEnvelope::parse(br#"{"type":"join","from":"a","message_id":"m","timestamp":1}"#),
            Err(ProtocolError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn unknown_types_pass_through() {
        let raw = br#"{"version":"1.0","type":"reaction","message_id":"m","from":"a","payload":{"emoji":"+1"},"timestamp":5,"signature":""}"#;
        let env = ProtocolEnvelope::parse(raw).unwrap();
        assert_eq!(env.kind, EnvelopeType::Other("reaction".into()));
        match env.resolve_payload().unwrap() {
            Payload::Opaque(value) => assert_eq!(value["emoji"], "+1"),
            other => panic!("expected opaque payload, got {other:?}"),
        }
        let reencoded = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert!(reencoded.contains("\"type\":\"reaction\""));
    }

    #[test]
    fn wrong_payload_shape_is_a_payload_error() {
        let mut env = ProtocolEnvelope::build(EnvelopeType::Dm, "a", "m");
        env.payload = serde_json::json!({ "nope": true });
        assert!(matches!(env.resolve_payload(), Err(ProtocolError::Payload(_))));

        let empty = ProtocolEnvelope::build(EnvelopeType::Pong, "a", "m");
        assert_eq!(empty.resolve_payload().unwrap(), Payload::Empty);
    }
}
