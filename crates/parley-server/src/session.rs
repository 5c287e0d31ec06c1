//! One client session: a reader task running the control plane and a writer
//! task draining the connection's outbound queue onto the transport.
//!
//! The two tasks share nothing but the hub's bounded queue and the
//! connection's cancellation token. Every request failure is turned into an
//! `error` event for this connection alone; only transport failures and
//! missed liveness deadlines end the session.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use parley_shared::codec;
use parley_shared::constants::DEFAULT_NICKNAME;
use parley_shared::message::{now_micros, validate_content};
use parley_shared::protocol::InvitePayload;
use parley_shared::{Command, CommandContext, Identity, Message, Payload, RoomId};
use parley_store::{Storage, User};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::events::ServerEvent;
use crate::hub::{ConnectionHandle, ConnectionHub, ConnectionId, Outbound, SessionUser};
use crate::keyring::Keyring;
use crate::rate_limit::RateLimiter;
use crate::rooms::{Member, RoomAuthority, RoomError, RoomView};
use crate::transport::{Frame, TransportError};

const MAX_USERNAME_CHARS: usize = 32;
const MAX_HISTORY_LIMIT: i64 = 500;

/// Everything a session needs, shared by all of them.
pub struct ChatContext {
    pub hub: Arc<ConnectionHub>,
    pub rooms: Arc<RoomAuthority>,
    pub storage: Arc<dyn Storage>,
    pub keyring: Arc<Keyring>,
    /// `send_message` budget per user id.
    pub send_limiter: RateLimiter<String>,
    pub write_timeout: Duration,
}

/// Control-plane request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Auth {
        #[serde(default)]
        username: Option<String>,
    },
    CreateRoom {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        is_private: bool,
    },
    /// Subscribe by room id (member, or any public room) or by invite code.
    JoinRoom {
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        invite_code: Option<String>,
    },
    LeaveRoom,
    SendMessage {
        content: String,
    },
    GetMessages {
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        limit: i64,
    },
}

/// Drive one client connection until it closes, fails or goes silent.
pub async fn run_session<S, R>(ctx: Arc<ChatContext>, sink: S, mut stream: R)
where
    S: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    R: Stream<Item = Result<Frame, TransportError>> + Send + Unpin,
{
    let (handle, outbound) = ctx.hub.open();
    let id = handle.id();
    info!(connection = %id, "Session opened");

    let writer = tokio::spawn(write_loop(
        id,
        sink,
        outbound,
        handle.closed_token(),
        ctx.write_timeout,
    ));

    let mut session = Session {
        ctx: ctx.clone(),
        handle,
        identity: None,
    };
    if let Err(e) = session.read_loop(&mut stream).await {
        debug!(connection = %id, error = %e, "Transport failed");
    }

    ctx.hub.deregister(id);
    if let Err(e) = writer.await {
        warn!(connection = %id, error = %e, "Writer task failed");
    }
    info!(connection = %id, "Session closed");
}

async fn write_loop<S>(
    id: ConnectionId,
    mut sink: S,
    mut outbound: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    write_timeout: Duration,
) where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let frame = match item {
            Outbound::Text(bytes) => Frame::Text(String::from_utf8_lossy(&bytes).into_owned()),
            Outbound::Ping => Frame::Ping(Vec::new()),
        };

        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = %id, error = %e, "Write failed");
                closed.cancel();
                break;
            }
            Err(_) => {
                warn!(connection = %id, "Write deadline passed");
                closed.cancel();
                break;
            }
        }
    }

    let _ = tokio::time::timeout(write_timeout, sink.send(Frame::Close)).await;
}

struct Session {
    ctx: Arc<ChatContext>,
    handle: Arc<ConnectionHandle>,
    identity: Option<Identity>,
}

impl Session {
    fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    async fn read_loop<R>(&mut self, stream: &mut R) -> Result<(), TransportError>
    where
        R: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        let closed = self.handle.closed_token();
        let liveness = self.ctx.hub.config().liveness_timeout;

        loop {
            let deadline = self.handle.last_ack() + liveness;
            let next = tokio::select! {
                _ = closed.cancelled() => return Ok(()),
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    info!(connection = %self.id(), "Read deadline passed");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => frame?,
            };

            match frame {
                Frame::Text(text) => self.handle_text(&text).await,
                Frame::Pong(_) => self.handle.record_pong(),
                Frame::Binary(_) => {
                    self.reject(SessionError::BadRequest("binary frames are not supported".into()))
                }
                // The transport answers pings itself.
                Frame::Ping(_) => {}
                Frame::Close => return Ok(()),
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let result = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Err(SessionError::BadRequest(e.to_string())),
        };
        if let Err(e) = result {
            self.reject(e);
        }
    }

    fn reject(&self, e: SessionError) {
        if e.code() == "internal" {
            warn!(connection = %self.id(), error = %e, "Request failed");
        } else {
            debug!(connection = %self.id(), code = e.code(), error = %e, "Request rejected");
        }
        self.send(&ServerEvent::from(&e));
    }

    fn send(&self, event: &ServerEvent) -> bool {
        self.ctx.hub.send_to(self.id(), event)
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<(), SessionError> {
        match request {
            ClientRequest::Auth { username } => self.auth(username.as_deref()),
            ClientRequest::CreateRoom {
                name,
                description,
                is_private,
            } => self.create_room(&name, &description, is_private),
            ClientRequest::JoinRoom {
                room_id,
                invite_code,
            } => self.join_room(room_id, invite_code.as_deref()),
            ClientRequest::LeaveRoom => self.leave_room(),
            ClientRequest::SendMessage { content } => self.send_message(&content).await,
            ClientRequest::GetMessages { room_id, limit } => self.get_messages(room_id, limit),
        }
    }

    fn whoami(&self) -> Result<(SessionUser, Identity), SessionError> {
        let user = self.handle.user().ok_or(SessionError::NotAuthenticated)?;
        let identity = self.identity.clone().ok_or(SessionError::NotAuthenticated)?;
        Ok((user, identity))
    }

    /// The caller's unblocked membership of `room_id`.
    fn membership(&self, room_id: RoomId, user_id: &str) -> Result<Member, SessionError> {
        let room = self.ctx.rooms.get_room(room_id)?;
        let member = room.member(user_id).cloned().ok_or(SessionError::NotMember)?;
        if member.is_blocked {
            return Err(SessionError::Blocked);
        }
        Ok(member)
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    fn auth(&mut self, username: Option<&str>) -> Result<(), SessionError> {
        let requested = username.map(str::trim).filter(|name| !name.is_empty());
        let identity = match requested {
            Some(name) => {
                if name.chars().count() > MAX_USERNAME_CHARS {
                    return Err(SessionError::BadRequest(format!(
                        "username exceeds {MAX_USERNAME_CHARS} characters"
                    )));
                }
                if name.chars().any(char::is_whitespace) {
                    return Err(SessionError::BadRequest("username cannot contain spaces".into()));
                }
                self.ctx.keyring.identity_for(name)?
            }
            None => Identity::generate(DEFAULT_NICKNAME),
        };

        let user = SessionUser {
            user_id: identity.public_key_hex(),
            username: identity.nickname().to_string(),
        };
        self.ctx.hub.authenticate(self.id(), user.clone())?;
        self.identity = Some(identity.clone());

        let now = now_micros();
        self.ctx.storage.save_user(&User {
            id: user.user_id.clone(),
            username: user.username.clone(),
            public_key: user.user_id.clone(),
            created_at: now,
            last_seen: now,
            is_blocked: false,
        })?;

        info!(connection = %self.id(), user = %user.username, fingerprint = %identity.fingerprint(), "Session authenticated");
        self.send(&ServerEvent::AuthResponse {
            public_key: user.user_id.clone(),
            user_id: user.user_id,
            username: user.username,
            fingerprint: identity.fingerprint(),
        });
        Ok(())
    }

    fn create_room(&self, name: &str, description: &str, is_private: bool) -> Result<(), SessionError> {
        let (user, _) = self.whoami()?;
        let room = self.ctx.rooms.create_room(
            name,
            description,
            is_private,
            &user.user_id,
            &user.username,
            &user.user_id,
        )?;
        let room = self.ctx.hub.join_room(self.id(), room.id)?;
        self.send(&ServerEvent::RoomCreated {
            room: RoomView::from(&room),
        });
        Ok(())
    }

    fn join_room(&self, room_id: Option<RoomId>, invite_code: Option<&str>) -> Result<(), SessionError> {
        let (user, _) = self.whoami()?;
        let room_id = match (invite_code, room_id) {
            (Some(code), _) => self.join_by_code(&user, code)?,
            (None, Some(room_id)) => {
                let room = self.ctx.rooms.get_room(room_id)?;
                if room.member(&user.user_id).is_none() && !room.is_private {
                    self.join_by_code(&user, &room.invite_code)?;
                }
                room_id
            }
            (None, None) => {
                return Err(SessionError::BadRequest(
                    "room_id or invite_code is required".into(),
                ))
            }
        };
        self.subscribe(room_id)
    }

    /// Become a member through an invite code. Already being one is fine.
    fn join_by_code(&self, user: &SessionUser, code: &str) -> Result<RoomId, SessionError> {
        match self
            .ctx
            .rooms
            .join_by_invite(code, &user.user_id, &user.username, &user.user_id)
        {
            Ok(room) => Ok(room.id),
            Err(RoomError::AlreadyMember) => Ok(self.ctx.rooms.room_by_invite_code(code)?.id),
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe(&self, room_id: RoomId) -> Result<(), SessionError> {
        let room = self.ctx.hub.join_room(self.id(), room_id)?;
        self.send(&ServerEvent::RoomJoined {
            room: RoomView::from(&room),
        });
        Ok(())
    }

    fn leave_room(&self) -> Result<(), SessionError> {
        self.whoami()?;
        let room_id = self.ctx.hub.leave_room(self.id())?;
        self.send(&ServerEvent::RoomLeft { room_id });
        Ok(())
    }

    async fn send_message(&self, content: &str) -> Result<(), SessionError> {
        let (user, identity) = self.whoami()?;
        if !self.ctx.send_limiter.check(&user.user_id).await {
            return Err(SessionError::RateLimited);
        }

        let content = validate_content(content)?;
        if content.starts_with('/') {
            return self.run_command(&user, &identity, &content);
        }

        let room_id = self.handle.room().ok_or(SessionError::NotInRoom)?;
        self.membership(room_id, &user.user_id)?;

        let mut message = Message::new(room_id, &user.user_id, &user.username, content);
        codec::sign_with(&mut message, &identity)?;
        self.ctx.storage.save_message(&message)?;

        let message_id = message.id;
        let delivered = self
            .ctx
            .hub
            .broadcast(room_id, &ServerEvent::Message { message }, None);
        debug!(room = %room_id, message = %message_id, delivered, "Message broadcast");
        Ok(())
    }

    fn get_messages(&self, room_id: Option<RoomId>, limit: i64) -> Result<(), SessionError> {
        let (user, _) = self.whoami()?;
        let room_id = room_id
            .or_else(|| self.handle.room())
            .ok_or(SessionError::NotInRoom)?;
        self.membership(room_id, &user.user_id)?;

        let messages = self
            .ctx
            .storage
            .get_messages(room_id, limit.min(MAX_HISTORY_LIMIT))?;
        self.send(&ServerEvent::MessageHistory { room_id, messages });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Slash commands
    // -----------------------------------------------------------------------

    fn run_command(&self, user: &SessionUser, identity: &Identity, content: &str) -> Result<(), SessionError> {
        let command = Command::parse(content)?;
        let current = self.handle.room();
        let current_str = current.map(|id| id.to_string());
        let ctx = CommandContext {
            from: &user.user_id,
            nickname: &user.username,
            public_key: &user.user_id,
            room_id: current_str.as_deref(),
        };
        let mut envelope = command.to_envelope(&ctx)?;
        debug!(connection = %self.id(), command = command.name(), envelope = %envelope.message_id, "Running command");

        match command {
            Command::Join { invite_code } => {
                let room_id = self.join_by_code(user, &invite_code)?;
                self.subscribe(room_id)
            }
            Command::Leave { reason } => {
                let room_id = current.ok_or(SessionError::NotInRoom)?;
                self.ctx.rooms.leave(room_id, &user.user_id)?;
                self.ctx.hub.leave_room(self.id())?;
                self.ctx.hub.unsubscribe_user(room_id, &user.user_id);
                self.send(&ServerEvent::RoomLeft { room_id });
                info!(room = %room_id, user = %user.username, reason = reason.as_deref().unwrap_or(""), "Left room");
                Ok(())
            }
            Command::Invite { target } => {
                let room_id = current.ok_or(SessionError::NotInRoom)?;
                self.membership(room_id, &user.user_id)?;
                let room = self.ctx.rooms.get_room(room_id)?;
                envelope.attach_payload(Payload::Invite(InvitePayload {
                    room_id: room_id.to_string(),
                    target: target.clone(),
                    invite_code: Some(room.invite_code.clone()),
                    room_name: Some(room.name.clone()),
                    description: Some(room.description.clone()),
                    is_private: room.is_private,
                }))?;
                codec::sign_with(&mut envelope, identity)?;

                let delivered = self
                    .ctx
                    .hub
                    .send_to_username(&target, &ServerEvent::Invite { envelope });
                if delivered == 0 {
                    return Err(SessionError::UserOffline(target));
                }
                info!(room = %room_id, from = %user.username, to = %target, "Invite sent");
                Ok(())
            }
            Command::Block { nickname } => self.set_blocked(user, current, &nickname, true),
            Command::Unblock { nickname } => self.set_blocked(user, current, &nickname, false),
            Command::Dm { target, .. } => {
                codec::sign_with(&mut envelope, identity)?;
                let event = ServerEvent::DirectMessage { envelope };
                let delivered = self.ctx.hub.send_to_username(&target, &event);
                if delivered == 0 {
                    return Err(SessionError::UserOffline(target));
                }
                if target != user.username {
                    self.send(&event);
                }
                debug!(from = %user.username, to = %target, delivered, "Direct message delivered");
                Ok(())
            }
        }
    }

    fn set_blocked(
        &self,
        user: &SessionUser,
        room_id: Option<RoomId>,
        nickname: &str,
        blocked: bool,
    ) -> Result<(), SessionError> {
        let room_id = room_id.ok_or(SessionError::NotInRoom)?;
        let actor = self.membership(room_id, &user.user_id)?;
        if !actor.role.can_moderate() {
            return Err(SessionError::Forbidden);
        }

        let target = self
            .ctx
            .rooms
            .find_member_by_username(room_id, nickname)
            .ok_or(RoomError::NotFound("member"))?;
        if target.user_id == user.user_id || target.role > actor.role {
            return Err(SessionError::Forbidden);
        }

        let updated = self.ctx.rooms.set_blocked(room_id, &target.user_id, blocked)?;
        self.ctx.hub.broadcast(
            room_id,
            &ServerEvent::MemberBlocked {
                room_id,
                user_id: updated.user_id.clone(),
                username: updated.username.clone(),
                is_blocked: blocked,
            },
            None,
        );
        if blocked {
            self.ctx.hub.unsubscribe_user(room_id, &updated.user_id);
        }

        info!(room = %room_id, by = %user.username, target = %updated.username, blocked, "Block flag changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use parley_store::MemoryStorage;
    use serde_json::json;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::hub::HubConfig;

    struct TestClient {
        input: UnboundedSender<Result<Frame, TransportError>>,
        output: UnboundedReceiver<Frame>,
        task: JoinHandle<()>,
    }

    impl TestClient {
        fn request(&self, value: serde_json::Value) {
            self.input
                .unbounded_send(Ok(Frame::Text(value.to_string())))
                .unwrap();
        }

        async fn next_event(&mut self) -> ServerEvent {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(5), self.output.next())
                    .await
                    .expect("timed out waiting for an event")
                    .expect("session closed");
                if let Frame::Text(text) = frame {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }

        async fn expect_error(&mut self, code: &str) {
            match self.next_event().await {
                ServerEvent::Error { code: got, .. } => assert_eq!(got, code),
                other => panic!("expected {code} error, got {other:?}"),
            }
        }

        async fn auth(&mut self, username: &str) -> String {
            self.request(json!({"type": "auth", "username": username}));
            match self.next_event().await {
                ServerEvent::AuthResponse { user_id, .. } => user_id,
                other => panic!("unexpected {other:?}"),
            }
        }

        async fn create_room(&mut self, name: &str, is_private: bool) -> RoomView {
            self.request(json!({"type": "create_room", "name": name, "is_private": is_private}));
            match self.next_event().await {
                ServerEvent::RoomCreated { room } => room,
                other => panic!("unexpected {other:?}"),
            }
        }

        fn say(&mut self, content: &str) {
            self.request(json!({"type": "send_message", "content": content}));
        }
    }

    fn context_with(send_per_minute: u32) -> Arc<ChatContext> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let rooms = Arc::new(RoomAuthority::new(storage.clone()));
        let hub = Arc::new(ConnectionHub::new(rooms.clone(), HubConfig::default()));
        Arc::new(ChatContext {
            hub,
            rooms,
            storage,
            keyring: Arc::new(Keyring::ephemeral()),
            send_limiter: RateLimiter::per_minute(send_per_minute),
            write_timeout: Duration::from_secs(10),
        })
    }

    fn context() -> Arc<ChatContext> {
        context_with(60)
    }

    fn connect(ctx: &Arc<ChatContext>) -> TestClient {
        let (input, input_rx) = unbounded();
        let (output_tx, output) = unbounded::<Frame>();
        let sink = output_tx.sink_map_err(|_| TransportError::Closed);
        let task = tokio::spawn(run_session(ctx.clone(), sink, input_rx));
        TestClient {
            input,
            output,
            task,
        }
    }

    #[tokio::test]
    async fn requests_before_auth_are_rejected() {
        let ctx = context();
        let mut client = connect(&ctx);

        client.say("hello");
        client.expect_error("auth").await;

        client.request(json!({"type": "nope"}));
        client.expect_error("validation").await;

        client.request(json!({"no_type": true}));
        client.expect_error("validation").await;
    }

    #[tokio::test]
    async fn message_is_signed_stored_and_echoed() {
        let ctx = context();
        let mut alice = connect(&ctx);
        let alice_id = alice.auth("alice").await;
        let room = alice.create_room("General", false).await;

        alice.say("  hello\u{7}  ");
        let message = match alice.next_event().await {
            ServerEvent::Message { message } => message,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(message.content, "hello");
        assert_eq!(message.user_id, alice_id);
        assert!(codec::verify_hex(&message, &alice_id));

        let stored = ctx.storage.get_messages(room.id, 0).unwrap();
        assert_eq!(stored, vec![message]);
    }

    #[tokio::test]
    async fn invite_code_join_and_broadcast_to_everyone() {
        let ctx = context();
        let mut alice = connect(&ctx);
        let mut bob = connect(&ctx);
        let alice_id = alice.auth("alice").await;
        bob.auth("bob").await;
        let room = alice.create_room("General", false).await;

        bob.say(&format!("/join {}", room.invite_code));
        match bob.next_event().await {
            ServerEvent::RoomJoined { room: joined } => {
                assert_eq!(joined.id, room.id);
                assert_eq!(joined.members.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            alice.next_event().await,
            ServerEvent::UserJoined { username, .. } if username == "bob"
        ));

        alice.say("hello");
        for client in [&mut alice, &mut bob] {
            match client.next_event().await {
                ServerEvent::Message { message } => {
                    assert_eq!(message.content, "hello");
                    assert!(codec::verify_hex(&message, &alice_id));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn private_rooms_need_an_invite() {
        let ctx = context();
        let mut alice = connect(&ctx);
        let mut bob = connect(&ctx);
        alice.auth("alice").await;
        bob.auth("bob").await;
        let secret = alice.create_room("Secret", true).await;
        let open = alice.create_room("Open", false).await;

        bob.request(json!({"type": "join_room", "room_id": secret.id}));
        bob.expect_error("not_in_room").await;

        bob.request(json!({"type": "join_room", "room_id": open.id}));
        assert!(matches!(bob.next_event().await, ServerEvent::RoomJoined { .. }));

        bob.request(json!({"type": "join_room", "invite_code": secret.invite_code}));
        assert!(matches!(
            bob.next_event().await,
            ServerEvent::RoomJoined { room } if room.id == secret.id
        ));
    }

    #[tokio::test]
    async fn history_is_chronological_and_members_only() {
        let ctx = context();
        let mut alice = connect(&ctx);
        let mut bob = connect(&ctx);
        alice.auth("alice").await;
        bob.auth("bob").await;
        let room = alice.create_room("General", false).await;

        for text in ["one", "two", "three"] {
            alice.say(text);
            alice.next_event().await;
        }

        alice.request(json!({"type": "get_messages", "limit": 2}));
        match alice.next_event().await {
            ServerEvent::MessageHistory { room_id, messages } => {
                assert_eq!(room_id, room.id);
                let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, ["two", "three"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        bob.request(json!({"type": "get_messages", "room_id": room.id}));
        bob.expect_error("not_in_room").await;
    }

    #[tokio::test]
    async fn block_requires_moderator_and_evicts() {
        let ctx = context();
        let mut alice = connect(&ctx);
        let mut bob = connect(&ctx);
        alice.auth("alice").await;
        bob.auth("bob").await;
        let room = alice.create_room("General", false).await;
        bob.request(json!({"type": "join_room", "invite_code": room.invite_code}));
        bob.next_event().await;
        alice.next_event().await;

        bob.say("/block alice");
        bob.expect_error("forbidden").await;

        alice.say("/block bob");
        for client in [&mut alice, &mut bob] {
            assert!(matches!(
                client.next_event().await,
                ServerEvent::MemberBlocked { username, is_blocked: true, .. } if username == "bob"
            ));
        }
        assert!(matches!(bob.next_event().await, ServerEvent::RoomLeft { .. }));

        bob.say("let me back");
        bob.expect_error("not_in_room").await;
        bob.request(json!({"type": "join_room", "room_id": room.id}));
        bob.expect_error("forbidden").await;

        alice.say("/unblock bob");
        assert!(matches!(
            alice.next_event().await,
            ServerEvent::MemberBlocked { is_blocked: false, .. }
        ));
        bob.request(json!({"type": "join_room", "room_id": room.id}));
        assert!(matches!(bob.next_event().await, ServerEvent::RoomJoined { .. }));
    }

    #[tokio::test]
    async fn dm_and_invite_reach_the_target_only() {
        let ctx = context();
        let mut alice = connect(&ctx);
        let mut bob = connect(&ctx);
        let alice_id = alice.auth("alice").await;
        bob.auth("bob").await;
        let room = alice.create_room("General", true).await;

        alice.say("/dm carol hi");
        alice.expect_error("user_offline").await;

        alice.say("/dm bob hi there");
        for client in [&mut bob, &mut alice] {
            match client.next_event().await {
                ServerEvent::DirectMessage { envelope } => {
                    assert_eq!(envelope.to.as_deref(), Some("bob"));
                    assert_eq!(envelope.payload["content"], "hi there");
                    assert!(codec::verify_hex(&envelope, &alice_id));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        alice.say("/invite bob");
        match bob.next_event().await {
            ServerEvent::Invite { envelope } => {
                assert_eq!(envelope.payload["invite_code"], room.invite_code.as_str());
                assert_eq!(envelope.payload["room_name"], "General");
                assert!(codec::verify_hex(&envelope, &alice_id));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_commands_and_leave() {
        let ctx = context();
        let mut alice = connect(&ctx);
        alice.auth("alice").await;

        alice.say("/leave");
        alice.expect_error("validation").await;
        alice.say("/frobnicate");
        alice.expect_error("unknown_command").await;

        let room = alice.create_room("General", false).await;
        alice.say("/leave bye all");
        assert!(matches!(
            alice.next_event().await,
            ServerEvent::RoomLeft { room_id } if room_id == room.id
        ));
        assert!(!ctx.rooms.is_member(room.id, &ctx.keyring.identity_for("alice").unwrap().public_key_hex()));
    }

    #[tokio::test]
    async fn send_rate_is_limited_per_user() {
        let ctx = context_with(2);
        let mut alice = connect(&ctx);
        alice.auth("alice").await;
        alice.create_room("General", false).await;

        alice.say("one");
        alice.next_event().await;
        alice.say("two");
        alice.next_event().await;
        alice.say("three");
        alice.expect_error("rate_limited").await;
    }

    #[tokio::test]
    async fn closing_the_transport_deregisters() {
        let ctx = context();
        let mut alice = connect(&ctx);
        alice.auth("alice").await;
        assert_eq!(ctx.hub.connection_count(), 1);

        alice.input.unbounded_send(Ok(Frame::Close)).unwrap();
        alice.task.await.unwrap();
        assert_eq!(ctx.hub.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_hits_the_read_deadline() {
        let ctx = context();
        let alice = connect(&ctx);

        tokio::time::timeout(Duration::from_secs(120), alice.task)
            .await
            .expect("session should end")
            .unwrap();
        assert_eq!(ctx.hub.connection_count(), 0);
    }
}
