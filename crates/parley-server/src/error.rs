use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_shared::error::{CodecError, CommandError, IdentityError, MessageError, ProtocolError};
use parley_store::StoreError;
use thiserror::Error;

use crate::rooms::RoomError;

/// Errors surfaced over the REST API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RoomError> for ServerError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::Validation(msg) => ServerError::BadRequest(msg),
            RoomError::NotFound(what) => ServerError::NotFound(what.to_string()),
            RoomError::AlreadyMember => ServerError::BadRequest("already a member".into()),
            RoomError::Storage(inner) => ServerError::Internal(inner.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failure of one control-plane request. Reported to the issuing connection
/// only; never fatal to the hub.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authenticate first")]
    NotAuthenticated,

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("join a room first")]
    NotInRoom,

    #[error("you are not a member of this room")]
    NotMember,

    #[error("you are blocked in this room")]
    Blocked,

    #[error("only moderators can do that")]
    Forbidden,

    #[error("too many messages, slow down")]
    RateLimited,

    #[error("{0} is not connected")]
    UserOffline(String),

    #[error("connection is closed")]
    Closed,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Content(#[from] MessageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("signing failed: {0}")]
    Codec(#[from] CodecError),

    #[error("identity unavailable: {0}")]
    Identity(#[from] IdentityError),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotAuthenticated | SessionError::AlreadyAuthenticated => "auth",
            SessionError::NotInRoom | SessionError::NotMember => "not_in_room",
            SessionError::Blocked | SessionError::Forbidden => "forbidden",
            SessionError::RateLimited => "rate_limited",
            SessionError::UserOffline(_) => "user_offline",
            SessionError::Closed => "closed",
            SessionError::BadRequest(_) | SessionError::Content(_) => "validation",
            SessionError::Protocol(_) => "protocol",
            SessionError::Room(RoomError::Validation(_)) => "validation",
            SessionError::Room(RoomError::NotFound(_)) => "not_found",
            SessionError::Room(RoomError::AlreadyMember) => "already_member",
            SessionError::Command(CommandError::Unknown(_)) => "unknown_command",
            SessionError::Command(_) => "validation",
            SessionError::Room(RoomError::Storage(_))
            | SessionError::Codec(_)
            | SessionError::Identity(_)
            | SessionError::Store(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_codes() {
        assert_eq!(SessionError::Room(RoomError::AlreadyMember).code(), "already_member");
        assert_eq!(
            SessionError::Command(CommandError::Unknown("x".into())).code(),
            "unknown_command"
        );
        assert_eq!(SessionError::Command(CommandError::Empty).code(), "validation");
        assert_eq!(SessionError::Room(RoomError::NotFound("room")).code(), "not_found");
    }

    #[test]
    fn room_errors_map_to_http_status() {
        let response = ServerError::from(RoomError::NotFound("room")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ServerError::from(RoomError::Validation("bad".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
