use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_MESSAGE_CHARS;
use crate::error::MessageError;
use crate::types::RoomId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Command,
    System,
    Dm,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Command => "command",
            MessageType::System => "system",
            MessageType::Dm => "dm",
            MessageType::File => "file",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "command" => Ok(MessageType::Command),
            "system" => Ok(MessageType::System),
            "dm" => Ok(MessageType::Dm),
            "file" => Ok(MessageType::File),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A chat message. Append-only: once signed and stored it is never mutated.
///
/// Timestamps are kept at microsecond precision so that a message read back
/// from storage canonicalizes to exactly the bytes that were signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub room_id: RoomId,
    pub user_id: String,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(with = "timestamp_micros")]
    pub timestamp: DateTime<Utc>,
    /// Hex Ed25519 signature over the canonical form; empty when unsigned.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl Message {
    /// Build an unsigned message. Content starting with `/` is a command.
    pub fn new(
        room_id: RoomId,
        user_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let kind = if content.starts_with('/') {
            MessageType::Command
        } else {
            MessageType::Text
        };
        Self {
            id: Uuid::new_v4(),
            room_id,
            user_id: user_id.into(),
            username: username.into(),
            content,
            kind,
            encrypted: false,
            timestamp: now_micros(),
            signature: String::new(),
        }
    }

    /// Server-authored notice inside a room.
    pub fn system(room_id: RoomId, content: impl Into<String>) -> Self {
        let mut message = Self::new(room_id, "system", "system", content);
        message.kind = MessageType::System;
        message
    }

    pub fn is_command(&self) -> bool {
        self.kind == MessageType::Command
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// Current time truncated to microseconds.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Clean user-supplied chat content: strip control characters other than
/// newline and tab, trim, then enforce the length bound.
pub fn validate_content(raw: &str) -> Result<String, MessageError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return Err(MessageError::Empty);
    }
    if cleaned.chars().count() > MAX_MESSAGE_CHARS {
        return Err(MessageError::TooLong {
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(cleaned.to_string())
}

/// RFC 3339 UTC with exactly six fractional digits.
pub mod timestamp_micros {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
