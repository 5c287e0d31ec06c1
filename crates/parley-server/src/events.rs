//! Events the server pushes to WebSocket clients. Every event is a JSON
//! object tagged by `type`.

use parley_shared::{Message, ProtocolEnvelope, RoomId};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::rooms::RoomView;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthResponse {
        user_id: String,
        username: String,
        public_key: String,
        fingerprint: String,
    },
    RoomCreated {
        room: RoomView,
    },
    RoomJoined {
        room: RoomView,
    },
    RoomLeft {
        room_id: RoomId,
    },
    UserJoined {
        room_id: RoomId,
        user_id: String,
        username: String,
    },
    UserLeft {
        room_id: RoomId,
        user_id: String,
        username: String,
    },
    Message {
        message: Message,
    },
    MessageHistory {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    /// Signed `dm` envelope addressed to this user.
    DirectMessage {
        envelope: ProtocolEnvelope,
    },
    /// Signed `invite` envelope addressed to this user.
    Invite {
        envelope: ProtocolEnvelope,
    },
    MemberBlocked {
        room_id: RoomId,
        user_id: String,
        username: String,
        is_blocked: bool,
    },
    Error {
        code: String,
        message: String,
    },
}

impl From<&SessionError> for ServerEvent {
    fn from(e: &SessionError) -> Self {
        ServerEvent::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_by_type() {
        let event = ServerEvent::RoomLeft {
            room_id: RoomId::new(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "room_left");

        let error = ServerEvent::from(&SessionError::NotAuthenticated);
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "auth");
    }
}
